//! Parallel execution of a decomposed swarm.
//!
//! Subtasks run level by level: a level is every remaining subtask whose
//! dependencies are already leveled, and the whole level is awaited before
//! the next starts. Dependency results feed forward as a bounded context
//! prefix. Transient provider errors are retried with exponential backoff;
//! everything else fails the subtask and cascades to its dependents only.

use std::sync::LazyLock;

use regex::Regex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::decomposer::DecomposeOptions;
use super::Subtask;
use crate::core::Core;
use crate::core::error::Result;
use crate::core::router::{RoutedOptions, Strategy};

const CYCLE_ERROR: &str = "Unresolvable dependency cycle";
const DEP_TRUNCATION_SUFFIX: &str = "...(truncated)";

static TRANSIENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(timeout|ETIMEDOUT|rate.?limit|429|503|ECONNRESET)")
        .expect("transient pattern")
});

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub default_strategy: Strategy,
    pub caller: Option<String>,
    pub synthesize: bool,
    /// Synthesis template; `{{results}}` is replaced with the joined results.
    pub synthesis_prompt: Option<String>,
    pub decompose_prompt: Option<String>,
    /// Additional attempts after the first, for transient errors only.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Per-dependency cap on result text fed forward as context.
    pub dep_result_max_chars: usize,
    /// Cap on the whole context prefix.
    pub max_context_chars: usize,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::Balanced,
            caller: None,
            synthesize: true,
            synthesis_prompt: None,
            decompose_prompt: None,
            max_retries: 2,
            retry_base_delay_ms: 1000,
            dep_result_max_chars: 1000,
            max_context_chars: 4000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub swarm_id: String,
    /// True when every subtask completed.
    pub success: bool,
    /// Per-subtask result text, indexed by subtask position.
    pub results: Vec<Option<String>>,
    /// Per-subtask error, indexed by subtask position.
    pub errors: Vec<Option<String>>,
    pub synthesis: Option<String>,
}

/// Group subtasks into topological levels. Returns the levels plus any
/// indices that could not be leveled (a cycle, which validated input never
/// produces).
pub(crate) fn compute_levels(subtasks: &[Subtask]) -> (Vec<Vec<usize>>, Vec<usize>) {
    let mut level_of: Vec<Option<usize>> = vec![None; subtasks.len()];
    let mut levels: Vec<Vec<usize>> = Vec::new();

    loop {
        let mut next = Vec::new();
        for (idx, sub) in subtasks.iter().enumerate() {
            if level_of[idx].is_some() {
                continue;
            }
            let ready = sub
                .depends_on
                .iter()
                .all(|dep| level_of.get(*dep).copied().flatten().is_some());
            if ready {
                next.push(idx);
            }
        }
        if next.is_empty() {
            break;
        }
        for idx in &next {
            level_of[*idx] = Some(levels.len());
        }
        levels.push(next);
    }

    let remaining = level_of
        .iter()
        .enumerate()
        .filter(|(_, l)| l.is_none())
        .map(|(idx, _)| idx)
        .collect();
    (levels, remaining)
}

/// An error is worth retrying iff its message matches the transient set.
pub(crate) fn is_transient_error(message: &str) -> bool {
    TRANSIENT_PATTERN.is_match(message)
}

/// Delay before retry `retry` (0-based): `base * 2^retry`.
pub(crate) fn retry_delay_ms(base_delay_ms: u64, retry: u32) -> u64 {
    base_delay_ms.saturating_mul(1u64 << retry.min(16))
}

fn truncate_with_suffix(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}{}", &text[..idx], DEP_TRUNCATION_SUFFIX),
        None => text.to_string(),
    }
}

/// Concatenate dependency results, each prefixed with its description and
/// individually capped, then cap the whole prefix.
pub(crate) fn build_context_prefix(
    deps: &[(String, String)],
    dep_result_max_chars: usize,
    max_context_chars: usize,
) -> String {
    let joined = deps
        .iter()
        .map(|(description, result)| {
            format!(
                "{}:\n{}",
                description,
                truncate_with_suffix(result, dep_result_max_chars)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    match joined.char_indices().nth(max_context_chars) {
        Some((idx, _)) => joined[..idx].to_string(),
        None => joined,
    }
}

fn build_subtask_prompt(prefix: &str, description: &str) -> String {
    if prefix.is_empty() {
        description.to_string()
    } else {
        format!("{}\n\nNow: {}", prefix, description)
    }
}

impl Core {
    /// Decompose a task, enqueue it as a swarm, execute levels in parallel,
    /// and synthesize the results.
    pub async fn execute_decomposed(
        &self,
        description: &str,
        opts: &ExecuteOptions,
    ) -> Result<ExecutionReport> {
        let decompose_opts = DecomposeOptions {
            strategy: Some(opts.default_strategy),
            caller: opts.caller.clone(),
            decompose_prompt: opts.decompose_prompt.clone(),
        };
        let (swarm_id, task_ids, subtasks) =
            self.decompose_and_queue(description, &decompose_opts).await?;
        info!(
            "executing swarm {}: {} subtasks",
            swarm_id,
            subtasks.len()
        );

        let count = subtasks.len();
        let mut results: Vec<Option<String>> = vec![None; count];
        let mut errors: Vec<Option<String>> = vec![None; count];

        let (levels, remaining) = compute_levels(&subtasks);
        for idx in remaining {
            // Defense in depth: decomposer validation makes this unreachable.
            let _ = self.fail_task(&task_ids[idx], CYCLE_ERROR).await;
            errors[idx] = Some(CYCLE_ERROR.to_string());
        }

        for level in levels {
            let mut set = JoinSet::new();
            for idx in level {
                let sub = &subtasks[idx];
                if let Some(dep) = sub.depends_on.iter().find(|d| errors[**d].is_some()) {
                    let msg = format!("Dependency subtask {} failed", dep);
                    let _ = self.fail_task(&task_ids[idx], &msg).await;
                    errors[idx] = Some(msg);
                    continue;
                }

                let deps: Vec<(String, String)> = sub
                    .depends_on
                    .iter()
                    .filter_map(|d| {
                        results[*d]
                            .as_ref()
                            .map(|r| (subtasks[*d].description.clone(), r.clone()))
                    })
                    .collect();
                let prefix =
                    build_context_prefix(&deps, opts.dep_result_max_chars, opts.max_context_chars);
                let prompt = build_subtask_prompt(&prefix, &sub.description);
                let strategy = sub
                    .strategy
                    .as_deref()
                    .and_then(Strategy::from_name)
                    .unwrap_or(opts.default_strategy);

                set.spawn(run_subtask(
                    self.clone(),
                    task_ids[idx].clone(),
                    idx,
                    prompt,
                    strategy,
                    sub.capability.clone(),
                    opts.caller.clone(),
                    opts.max_retries,
                    opts.retry_base_delay_ms,
                ));
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((idx, Ok(text))) => results[idx] = Some(text),
                    Ok((idx, Err(msg))) => errors[idx] = Some(msg),
                    Err(e) => warn!("subtask worker aborted: {}", e),
                }
            }
        }

        let success = errors.iter().all(Option::is_none);
        let all_failed = results.iter().all(Option::is_none);
        let synthesis = if opts.synthesize && !all_failed {
            Some(self.synthesize(&subtasks, &results, opts).await)
        } else {
            None
        };

        Ok(ExecutionReport {
            swarm_id,
            success,
            results,
            errors,
            synthesis,
        })
    }

    /// Combine completed subtask results into one answer. Falls back to the
    /// raw concatenation when the synthesis call itself fails.
    async fn synthesize(
        &self,
        subtasks: &[Subtask],
        results: &[Option<String>],
        opts: &ExecuteOptions,
    ) -> String {
        let joined = subtasks
            .iter()
            .zip(results)
            .filter_map(|(sub, result)| {
                result
                    .as_ref()
                    .map(|r| format!("[{}]: {}", sub.description, r))
            })
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");

        let prompt = match &opts.synthesis_prompt {
            Some(template) if template.contains("{{results}}") => {
                template.replace("{{results}}", &joined)
            }
            Some(template) => format!("{}\n\n{}", template, joined),
            None => format!(
                "Synthesize the following subtask results into a coherent final answer:\n\n{}",
                joined
            ),
        };

        match self
            .routed_llm(
                &prompt,
                RoutedOptions {
                    strategy: Some(Strategy::Balanced),
                    caller: opts.caller.clone(),
                    ..RoutedOptions::default()
                },
            )
            .await
        {
            Ok(response) => response.text,
            Err(e) => {
                warn!("synthesis call failed, returning raw results: {}", e);
                joined
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_subtask(
    core: Core,
    task_id: String,
    index: usize,
    prompt: String,
    strategy: Strategy,
    capability: String,
    caller: Option<String>,
    max_retries: u32,
    retry_base_delay_ms: u64,
) -> (usize, std::result::Result<String, String>) {
    let agent_id = format!("decomposer-{}", index);
    match core.claim_task_by_id(&task_id, &agent_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            let msg = format!("task {} was not claimable", task_id);
            return (index, Err(msg));
        }
        Err(e) => return (index, Err(e.to_string())),
    }
    if let Err(e) = core.mark_running(&task_id).await {
        warn!("could not mark {} running: {}", task_id, e);
    }

    let mut retry = 0;
    loop {
        let outcome = core
            .routed_llm(
                &prompt,
                RoutedOptions {
                    strategy: Some(strategy),
                    capability: Some(capability.clone()),
                    caller: caller.clone(),
                    ..RoutedOptions::default()
                },
            )
            .await;

        match outcome {
            Ok(response) => {
                if let Err(e) = core.complete_task(&task_id, &response.text).await {
                    warn!("could not complete {}: {}", task_id, e);
                }
                return (index, Ok(response.text));
            }
            Err(e) => {
                let msg = e.to_string();
                if retry < max_retries && is_transient_error(&msg) {
                    let delay = retry_delay_ms(retry_base_delay_ms, retry);
                    debug!(
                        "subtask {} transient error ({}), retry {} in {} ms",
                        index,
                        msg,
                        retry + 1,
                        delay
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    retry += 1;
                    continue;
                }
                if let Err(fail_err) = core.fail_task(&task_id, &msg).await {
                    warn!("could not fail {}: {}", task_id, fail_err);
                }
                return (index, Err(msg));
            }
        }
    }
}
