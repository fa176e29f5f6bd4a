//! Expert runtime: one bounded tool-calling loop per risk item.
//!
//! Each task gets a system message carrying the task anchor, a windowed
//! excerpt of the current file, an optional diff excerpt, and a strict
//! JSON output contract. The loop alternates reasoner calls and tool
//! executions until the model stops requesting tools, a budget trips
//! (rounds, tool calls, no-signal streak), or the deadline expires.
//! Budget breaches take the forced-finalize path: a tool-less call
//! presenting the evidence digest. Transport errors in the main loop
//! abort the task without a verdict; cancelled tasks contribute nothing.

pub mod history;
pub mod verdict;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::diff::DiffIndex;
use crate::prompts::{PromptRenderer, TemplateVars};
use crate::state::{Deadline, RiskItem, RiskType, sort_risk_items, verdict_format_instructions};
use crate::tools::WorkspaceTools;
use history::{
    build_evidence_digest, count_assistant_messages, count_recent_no_signal, count_tool_messages,
    shrink_history, truncate_text,
};
use llm_gateway::LlmGateway;
use llm_gateway::message::ChatMessage;
use verdict::{parse_verdict, zero_confidence_verdict};

const INITIAL_USER: &str = "Analyze the risk item above. Call tools if you need more \
                            information. When your analysis is complete, output the final JSON.";

const FINALIZE_USER: &str = "Output the final JSON object now. Do not call tools, do not explain.";

/// Dependencies for one expert stage run.
pub struct ExpertRuntime<'a> {
    pub gateway: &'a LlmGateway,
    pub prompts: &'a PromptRenderer,
    pub tools: &'a WorkspaceTools,
    pub cfg: &'a Config,
    pub diff: &'a DiffIndex,
}

impl ExpertRuntime<'_> {
    /// Validates every task across all risk types under the shared
    /// semaphore; completion order does not affect the (sorted) output.
    pub async fn run(
        &self,
        expert_tasks: &BTreeMap<RiskType, Vec<RiskItem>>,
        deadline: Deadline,
        semaphore: Arc<Semaphore>,
    ) -> BTreeMap<RiskType, Vec<RiskItem>> {
        let total: usize = expert_tasks.values().map(Vec::len).sum();
        info!(
            groups = expert_tasks.len(),
            tasks = total,
            "stage3: expert execution start"
        );

        let mut pending: FuturesUnordered<_> = expert_tasks
            .iter()
            .flat_map(|(rt, items)| items.iter().map(move |item| (*rt, item)))
            .map(|(rt, item)| {
                let semaphore = Arc::clone(&semaphore);
                async move {
                    let _permit = match semaphore.acquire().await {
                        Ok(p) => p,
                        Err(_) => return (rt, None),
                    };
                    if deadline.expired() {
                        return (rt, None);
                    }
                    (rt, self.validate_risk(item, deadline).await)
                }
            })
            .collect();

        let mut results: BTreeMap<RiskType, Vec<RiskItem>> = BTreeMap::new();
        while let Some((rt, verdict)) = pending.next().await {
            if let Some(v) = verdict {
                results.entry(rt).or_default().push(v);
            }
        }

        for group in results.values_mut() {
            sort_risk_items(group);
        }
        let validated: usize = results.values().map(Vec::len).sum();
        info!(validated, of = total, "stage3: expert execution done");
        results
    }

    /// Runs the bounded loop for one risk item.
    pub async fn validate_risk(&self, task: &RiskItem, deadline: Deadline) -> Option<RiskItem> {
        let max_rounds = self.cfg.system.max_expert_rounds;
        let max_tool_calls = self.cfg.system.max_expert_tool_calls;
        let tools_enabled = max_tool_calls > 0;
        let specs = tools_enabled.then(|| self.tools.specs());

        let file_line_count = self.tools.file_line_count(&task.file_path);
        let system = self.build_system_message(task);
        let mut log: Vec<ChatMessage> = vec![ChatMessage::user(INITIAL_USER)];

        loop {
            let round = count_assistant_messages(&log) + 1;
            debug!(
                round,
                risk = %task.risk_type,
                file = %task.file_path,
                line = %task.line_number,
                "stage3: expert round"
            );
            if round > max_rounds {
                let reason = format!("analysis rounds exhausted ({round} > {max_rounds})");
                return Some(self.finalize(task, &log, file_line_count, &reason).await);
            }

            let used = count_tool_messages(&log);
            if tools_enabled && used >= max_tool_calls {
                let reason = format!("tool calls exhausted ({used} >= {max_tool_calls})");
                return Some(self.finalize(task, &log, file_line_count, &reason).await);
            }
            let streak = count_recent_no_signal(&log, self.cfg.expert.no_signal_window);
            if streak >= self.cfg.expert.max_consecutive_no_signal_tools {
                let reason = format!(
                    "{streak} of the last {} tool results carried no signal",
                    self.cfg.expert.no_signal_window
                );
                return Some(self.finalize(task, &log, file_line_count, &reason).await);
            }

            if deadline.expired() {
                warn!(file = %task.file_path, "stage3: deadline expired, cancelling task");
                return None;
            }

            let mut request = Vec::with_capacity(self.cfg.expert.max_history_messages + 1);
            request.push(system.clone());
            request.extend(shrink_history(&log, &self.cfg.expert));

            let response = match self.gateway.invoke(&request, specs.as_deref()).await {
                Ok(r) => r,
                Err(e) => {
                    error!(
                        file = %task.file_path,
                        error = %e,
                        "stage3: reasoner call failed, aborting task"
                    );
                    return None;
                }
            };

            if response.has_tool_calls() {
                let calls = response.tool_calls.clone();
                log.push(response);
                for call in calls {
                    let content = self.tools.execute(&call);
                    log.push(ChatMessage::tool(call.id.clone(), content));
                }
                continue;
            }

            let text = response.content.clone();
            log.push(response);
            return Some(
                parse_verdict(&text, task, file_line_count)
                    .unwrap_or_else(|| zero_confidence_verdict(task)),
            );
        }
    }

    /// Forced-finalize path: present the evidence digest and demand JSON
    /// in a tool-less call. Failures yield a zero-confidence verdict.
    async fn finalize(
        &self,
        task: &RiskItem,
        log: &[ChatMessage],
        file_line_count: Option<u32>,
        reason: &str,
    ) -> RiskItem {
        warn!(
            file = %task.file_path,
            risk = %task.risk_type,
            reason,
            "stage3: forced finalize"
        );

        let digest = build_evidence_digest(&shrink_history(log, &self.cfg.expert), &self.cfg.expert);

        let mut system = format!(
            "Stop: {reason}. Do not call any tools. Based on the evidence collected so far, \
             output the final JSON verdict immediately, even if information is incomplete. \
             Some conclusions can rest on language semantics alone and need no further \
             repository evidence.\n\n{}\n\n## Output format (strict)\n{}",
            anchor_block(task),
            verdict_format_instructions()
        );
        if !digest.is_empty() {
            system.push_str(&format!(
                "\n\n## Evidence collected so far (truncated)\n{digest}"
            ));
        }

        let messages = [ChatMessage::system(system), ChatMessage::user(FINALIZE_USER)];
        match self.gateway.invoke(&messages, None).await {
            Ok(response) => parse_verdict(&response.content, task, file_line_count)
                .unwrap_or_else(|| zero_confidence_verdict(task)),
            Err(e) => {
                error!(file = %task.file_path, error = %e, "stage3: finalize call failed");
                zero_confidence_verdict(task)
            }
        }
    }

    /// System message: persona template + anchor + diff excerpt + file
    /// window + output contract.
    fn build_system_message(&self, task: &RiskItem) -> ChatMessage {
        let available_tools = self
            .tools
            .specs()
            .iter()
            .map(|s| format!("- **{}**: {}", s.name, s.description))
            .collect::<Vec<_>>()
            .join("\n");

        let mut vars = TemplateVars::new();
        vars.insert("risk_type", task.risk_type.as_str().to_string());
        vars.insert("available_tools", available_tools);

        let template = task.risk_type.template_name();
        let base = if self.prompts.exists(&template) {
            self.prompts.render(&template, &vars)
        } else {
            self.prompts.render("expert_generic", &vars)
        };
        let base = base.unwrap_or_else(|e| {
            warn!(error = %e, "stage3: expert template render failed, using bare persona");
            format!(
                "You are a meticulous code review expert for {} risks.",
                task.risk_type
            )
        });

        let mut content = format!("{base}\n\n{}", anchor_block(task));

        let file_diff = self.diff.file_diff(&task.file_path);
        if !file_diff.is_empty() {
            content.push_str(&format!(
                "\n\n## Diff context (truncated)\n{}",
                truncate_text(file_diff, self.cfg.expert.max_diff_chars)
            ));
        }

        let window = self.file_window(task);
        if !window.is_empty() {
            content.push_str(&window);
        }

        content.push_str(&format!(
            "\n\n## Output format (strict)\n{}",
            verdict_format_instructions()
        ));

        ChatMessage::system(content)
    }

    /// Windowed excerpt of the current file around the anchor, numbered
    /// absolutely.
    fn file_window(&self, task: &RiskItem) -> String {
        let raw = self.tools.read_file_content(&task.file_path);
        if raw.is_empty() {
            return String::new();
        }
        let lines: Vec<&str> = raw.lines().collect();
        let w = self.cfg.expert.context_window_lines;
        let lo = task.line_number.start.saturating_sub(w).max(1) as usize;
        let hi = (task.line_number.end.saturating_add(w) as usize).min(lines.len());
        if lo > hi {
            return String::new();
        }
        let snippet = lines[lo - 1..hi]
            .iter()
            .enumerate()
            .map(|(off, l)| format!("{}: {}", lo + off, l))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "\n\n## File content window (lines {lo}-{hi})\nOnly a local window around the task \
             lines is shown. Prefer read_file_snippet with a line range (set max_lines) for \
             more context.\n\n{snippet}"
        )
    }
}

/// Task anchor carried unchanged from the manager's work list.
fn anchor_block(task: &RiskItem) -> String {
    format!(
        "## Task anchor\nRisk type: {}\nFile path: {}\nLine range: {}\nDescription: {}",
        task.risk_type, task.file_path, task.line_number, task.description
    )
}
