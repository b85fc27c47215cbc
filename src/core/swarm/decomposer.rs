//! Task decomposition: ask a reasoning model to split work into subtasks,
//! then parse and validate its output into a dependency-checked array.

use serde_json::{Value, json};
use tracing::debug;

use super::{TaskMode, TaskSpec};
use crate::core::Core;
use crate::core::error::{CoreError, Result};
use crate::core::router::{RoutedOptions, Strategy};

const DEFAULT_CAPABILITY: &str = "reasoning";

/// A validated decomposition entry. `depends_on` holds indices into the same
/// array, each strictly less than the entry's own position.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Subtask {
    pub description: String,
    pub capability: String,
    pub mode: TaskMode,
    pub depends_on: Vec<usize>,
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DecomposeOptions {
    pub strategy: Option<Strategy>,
    pub caller: Option<String>,
    /// Custom prompt template; `{{task}}` is replaced with the description.
    pub decompose_prompt: Option<String>,
}

fn build_decompose_prompt(description: &str, template: Option<&str>) -> String {
    match template {
        Some(t) if t.contains("{{task}}") => t.replace("{{task}}", description),
        Some(t) => format!("{}\n\nTask: {}", t, description),
        None => format!(
            "Break the following task into 2-6 subtasks.\n\
             Respond with ONLY a JSON array. Each entry:\n\
             {{\"description\": \"<what to do>\", \"capability\": \
             \"<coding|reasoning|review|classification|extraction|creative>\", \
             \"mode\": \"inline\", \"depends_on\": [<indices of earlier entries>]}}\n\
             Rules: subtasks may only depend on entries before them; \
             independent subtasks get an empty depends_on.\n\n\
             Task: {}",
            description
        ),
    }
}

/// Parse LLM output into subtasks.
///
/// Accepts raw JSON or a fenced code block, tolerates prose around the
/// array, rejects anything that is not a non-empty array of entries with a
/// description and valid back-references.
pub fn parse_subtasks(text: &str) -> Result<Vec<Subtask>> {
    let trimmed = strip_fence(text.trim());
    let start = trimmed.find('[');
    let end = trimmed.rfind(']');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(CoreError::Decomposition(
            "no JSON array found in output".to_string(),
        ));
    };
    if end < start {
        return Err(CoreError::Decomposition(
            "no JSON array found in output".to_string(),
        ));
    }

    let parsed: Value = serde_json::from_str(&trimmed[start..=end])
        .map_err(|e| CoreError::Decomposition(format!("invalid JSON: {}", e)))?;
    let Some(entries) = parsed.as_array() else {
        return Err(CoreError::Decomposition("output is not an array".to_string()));
    };
    if entries.is_empty() {
        return Err(CoreError::Decomposition("subtask array is empty".to_string()));
    }

    let total = entries.len();
    let mut subtasks = Vec::with_capacity(total);
    for (index, entry) in entries.iter().enumerate() {
        let description = entry
            .get("description")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                CoreError::Decomposition(format!("entry {} is missing a description", index))
            })?;
        let capability = entry
            .get("capability")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_CAPABILITY)
            .to_string();
        let mode = entry
            .get("mode")
            .and_then(|v| v.as_str())
            .map(TaskMode::from_mode)
            .unwrap_or_default();
        let strategy = entry
            .get("strategy")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let mut depends_on = Vec::new();
        if let Some(deps) = entry.get("depends_on") {
            let Some(deps) = deps.as_array() else {
                return Err(CoreError::Decomposition(format!(
                    "entry {}: depends_on is not an array",
                    index
                )));
            };
            for dep in deps {
                let Some(dep) = dep.as_u64() else {
                    return Err(CoreError::Decomposition(format!(
                        "entry {}: dependency {} is not a non-negative integer",
                        index, dep
                    )));
                };
                let dep = dep as usize;
                if dep >= total || dep >= index {
                    return Err(CoreError::Decomposition(format!(
                        "entry {}: dependency index {} must reference an earlier entry",
                        index, dep
                    )));
                }
                depends_on.push(dep);
            }
        }

        subtasks.push(Subtask {
            description: description.to_string(),
            capability,
            mode,
            depends_on,
            strategy,
        });
    }
    Ok(subtasks)
}

/// Unwrap a fenced code block (```json ... ``` or plain ```), if present.
fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.rfind("```").map(|idx| rest[..idx].trim()).unwrap_or(rest)
}

impl Core {
    /// Ask a reasoning-capable model to decompose `description` and validate
    /// the result.
    pub async fn decompose(
        &self,
        description: &str,
        opts: &DecomposeOptions,
    ) -> Result<Vec<Subtask>> {
        let prompt = build_decompose_prompt(description, opts.decompose_prompt.as_deref());
        let response = self
            .routed_llm(
                &prompt,
                RoutedOptions {
                    strategy: Some(opts.strategy.unwrap_or(Strategy::Balanced)),
                    capability: Some(DEFAULT_CAPABILITY.to_string()),
                    caller: opts.caller.clone(),
                    ..RoutedOptions::default()
                },
            )
            .await?;
        let subtasks = parse_subtasks(&response.text)?;
        debug!("decomposed into {} subtasks", subtasks.len());
        Ok(subtasks)
    }

    /// Decompose and persist the result as a swarm ready for claiming.
    pub async fn decompose_and_queue(
        &self,
        description: &str,
        opts: &DecomposeOptions,
    ) -> Result<(String, Vec<String>, Vec<Subtask>)> {
        let subtasks = self.decompose(description, opts).await?;
        let specs = subtask_specs(&subtasks);
        let (swarm_id, task_ids) = self.create_swarm(None, specs).await?;
        Ok((swarm_id, task_ids, subtasks))
    }
}

/// Convert validated subtasks into queue rows, recording dependency indices
/// and capability in metadata.
pub(crate) fn subtask_specs(subtasks: &[Subtask]) -> Vec<TaskSpec> {
    subtasks
        .iter()
        .enumerate()
        .map(|(index, sub)| TaskSpec {
            description: sub.description.clone(),
            prompt: Some(sub.description.clone()),
            model: None,
            strategy: sub.strategy.clone(),
            mode: sub.mode,
            metadata: Some(json!({
                "depends_on": sub.depends_on,
                "capability": sub.capability,
                "subtask_index": index,
            })),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_array_parses_with_defaults() {
        let out = parse_subtasks(r#"[{"description":"A"},{"description":"B","depends_on":[0]}]"#)
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].description, "A");
        assert_eq!(out[0].capability, "reasoning");
        assert_eq!(out[0].mode, TaskMode::Inline);
        assert!(out[0].depends_on.is_empty());
        assert_eq!(out[1].depends_on, vec![0]);
    }

    #[test]
    fn fenced_block_is_unwrapped() {
        let text = "```json\n[{\"description\":\"A\"}]\n```";
        let out = parse_subtasks(text).unwrap();
        assert_eq!(out.len(), 1);
        let bare = "```\n[{\"description\":\"A\"}]\n```";
        assert_eq!(parse_subtasks(bare).unwrap().len(), 1);
    }

    #[test]
    fn prose_around_the_array_is_tolerated() {
        let text = "Here is the plan:\n[{\"description\":\"A\"}]\nGood luck!";
        assert_eq!(parse_subtasks(text).unwrap().len(), 1);
    }

    #[test]
    fn forward_dependency_is_rejected() {
        let err = parse_subtasks(
            r#"[{"description":"A","depends_on":[1]},{"description":"B"}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Decomposition(_)));
        assert!(err.to_string().contains("earlier entry"));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let err =
            parse_subtasks(r#"[{"description":"A"},{"description":"B","depends_on":[1]}]"#)
                .unwrap_err();
        assert!(matches!(err, CoreError::Decomposition(_)));
    }

    #[test]
    fn out_of_range_dependency_is_rejected() {
        let err =
            parse_subtasks(r#"[{"description":"A"},{"description":"B","depends_on":[5]}]"#)
                .unwrap_err();
        assert!(matches!(err, CoreError::Decomposition(_)));
    }

    #[test]
    fn non_integer_dependency_is_rejected() {
        for bad in [r#"[-1]"#, r#"[0.5]"#, r#"["0"]"#] {
            let text = format!(
                r#"[{{"description":"A"}},{{"description":"B","depends_on":{}}}]"#,
                bad
            );
            assert!(parse_subtasks(&text).is_err(), "accepted {}", bad);
        }
    }

    #[test]
    fn missing_description_is_rejected() {
        let err = parse_subtasks(r#"[{"capability":"coding"}]"#).unwrap_err();
        assert!(err.to_string().contains("missing a description"));
        let err = parse_subtasks(r#"[{"description":"   "}]"#).unwrap_err();
        assert!(err.to_string().contains("missing a description"));
    }

    #[test]
    fn empty_array_is_rejected() {
        assert!(parse_subtasks("[]").is_err());
    }

    #[test]
    fn non_array_output_is_rejected() {
        assert!(parse_subtasks(r#"{"description":"A"}"#).is_err());
        assert!(parse_subtasks("no json here").is_err());
    }

    #[test]
    fn agent_mode_is_preserved() {
        let out = parse_subtasks(r#"[{"description":"A","mode":"agent"}]"#).unwrap();
        assert_eq!(out[0].mode, TaskMode::Agent);
    }

    #[test]
    fn specs_record_dependencies_in_metadata() {
        let subtasks = parse_subtasks(
            r#"[{"description":"A"},{"description":"B","depends_on":[0],"capability":"coding"}]"#,
        )
        .unwrap();
        let specs = subtask_specs(&subtasks);
        assert_eq!(specs.len(), 2);
        let meta = specs[1].metadata.as_ref().unwrap();
        assert_eq!(meta["depends_on"], json!([0]));
        assert_eq!(meta["capability"], "coding");
        assert_eq!(meta["subtask_index"], 1);
    }

    #[test]
    fn default_prompt_mentions_the_task() {
        let prompt = build_decompose_prompt("ship the release", None);
        assert!(prompt.contains("ship the release"));
        assert!(prompt.contains("JSON array"));
    }

    #[test]
    fn custom_template_substitutes_task_placeholder() {
        let prompt = build_decompose_prompt("do X", Some("Plan carefully: {{task}}"));
        assert_eq!(prompt, "Plan carefully: do X");
        let appended = build_decompose_prompt("do X", Some("Plan carefully."));
        assert!(appended.ends_with("Task: do X"));
    }
}
