//! Matrix expansion for parallel run generation.

use gantry_core::ids::MatrixId;
use gantry_core::workflow::{WorkflowDefinition, render_value};
use serde_json::Value;
use std::collections::BTreeMap;

/// A single combination in an expanded matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixJob {
    pub index: usize,
    pub values: BTreeMap<String, Value>,
    pub display_name: String,
}

impl MatrixJob {
    /// Matrix values rendered the way steps see them.
    pub fn rendered(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), render_value(v)))
            .collect()
    }
}

/// Result of matrix expansion.
#[derive(Debug, Clone)]
pub struct MatrixExpansion {
    pub matrix_id: MatrixId,
    pub workflow: String,
    pub jobs: Vec<MatrixJob>,
    pub fail_fast: bool,
    pub max_parallel: Option<u32>,
}

/// Expander for matrix configurations.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a workflow's matrix into individual jobs.
    ///
    /// A workflow without a matrix expands to a single job with no values.
    pub fn expand(&self, workflow: &WorkflowDefinition) -> MatrixExpansion {
        let matrix_id = MatrixId::new();

        let Some(matrix) = workflow.matrix.as_ref() else {
            return MatrixExpansion {
                matrix_id,
                workflow: workflow.name.clone(),
                jobs: vec![MatrixJob {
                    index: 0,
                    values: BTreeMap::new(),
                    display_name: workflow.name.clone(),
                }],
                fail_fast: true,
                max_parallel: None,
            };
        };

        let mut combinations = if matrix.dimensions.is_empty() {
            Vec::new()
        } else {
            self.generate_combinations(&matrix.dimensions)
        };

        // Excludes only prune the generated product; includes are always kept.
        combinations.retain(|combo| {
            !matrix
                .exclude
                .iter()
                .any(|exclude| self.matches_exclude(combo, exclude))
        });

        for include in &matrix.include {
            if !combinations.contains(include) {
                combinations.push(include.clone());
            }
        }

        let jobs = combinations
            .into_iter()
            .enumerate()
            .map(|(index, values)| MatrixJob {
                index,
                display_name: self.format_display_name(&workflow.name, &values),
                values,
            })
            .collect();

        MatrixExpansion {
            matrix_id,
            workflow: workflow.name.clone(),
            jobs,
            fail_fast: matrix.fail_fast,
            max_parallel: matrix.max_parallel,
        }
    }

    /// Cross-product with the first dimension varying slowest.
    fn generate_combinations(
        &self,
        dimensions: &BTreeMap<String, Vec<Value>>,
    ) -> Vec<BTreeMap<String, Value>> {
        let mut result = vec![BTreeMap::new()];

        for (key, values) in dimensions {
            let mut next = Vec::with_capacity(result.len() * values.len());
            for combo in &result {
                for value in values {
                    let mut new_combo = combo.clone();
                    new_combo.insert(key.clone(), value.clone());
                    next.push(new_combo);
                }
            }
            result = next;
        }

        result
    }

    fn matches_exclude(
        &self,
        combo: &BTreeMap<String, Value>,
        exclude: &BTreeMap<String, Value>,
    ) -> bool {
        exclude
            .iter()
            .all(|(key, value)| combo.get(key) == Some(value))
    }

    fn format_display_name(&self, workflow_name: &str, values: &BTreeMap<String, Value>) -> String {
        if values.is_empty() {
            return workflow_name.to_string();
        }

        let parts: Vec<String> = values
            .iter()
            .map(|(k, v)| format!("{}={}", k, render_value(v)))
            .collect();

        format!("{} ({})", workflow_name, parts.join(", "))
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow(matrix: &str) -> WorkflowDefinition {
        let yaml = format!(
            "name: Build\n{}\nsteps:\n  - name: test\n    run: pytest\n",
            matrix
        );
        WorkflowDefinition::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn test_matrix_expansion() {
        let wf = workflow(
            r#"matrix:
  dimensions:
    os: [linux, macos]
    version: ["18", "20", "22"]
  max_parallel: 4"#,
        );

        let expansion = MatrixExpander::new().expand(&wf);

        assert_eq!(expansion.jobs.len(), 6); // 2 OS × 3 versions
        assert!(expansion.fail_fast);
        assert_eq!(expansion.max_parallel, Some(4));
        assert_eq!(expansion.jobs[0].display_name, "Build (os=linux, version=18)");
        assert_eq!(expansion.jobs[5].display_name, "Build (os=macos, version=22)");
    }

    #[test]
    fn test_matrix_with_exclude() {
        let wf = workflow(
            r#"matrix:
  dimensions:
    os: [linux, macos]
    arch: [amd64, arm64]
  exclude:
    - os: macos
      arch: amd64"#,
        );

        let expansion = MatrixExpander::new().expand(&wf);

        // 2x2 = 4, minus 1 excluded = 3
        assert_eq!(expansion.jobs.len(), 3);
        assert!(
            expansion
                .jobs
                .iter()
                .all(|j| j.display_name != "Build (arch=amd64, os=macos)")
        );
    }

    #[test]
    fn test_matrix_with_include() {
        let wf = workflow(
            r#"matrix:
  dimensions:
    python-version: ["3.9", "3.10"]
  include:
    - python-version: "3.12"
    - python-version: "3.9""#,
        );

        let expansion = MatrixExpander::new().expand(&wf);
        let names: Vec<_> = expansion.jobs.iter().map(|j| j.display_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Build (python-version=3.9)",
                "Build (python-version=3.10)",
                "Build (python-version=3.12)",
            ]
        );
    }

    #[test]
    fn test_include_survives_matching_exclude() {
        let wf = workflow(
            r#"matrix:
  dimensions:
    os: [linux, macos]
    arch: [amd64, arm64]
  exclude:
    - os: macos
  include:
    - os: macos
      arch: arm64"#,
        );

        let expansion = MatrixExpander::new().expand(&wf);
        let names: Vec<_> = expansion.jobs.iter().map(|j| j.display_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Build (arch=amd64, os=linux)",
                "Build (arch=arm64, os=linux)",
                "Build (arch=arm64, os=macos)",
            ]
        );
    }

    #[test]
    fn test_no_matrix_single_job() {
        let wf = workflow("");
        let expansion = MatrixExpander::new().expand(&wf);
        assert_eq!(expansion.jobs.len(), 1);
        assert!(expansion.jobs[0].values.is_empty());
        assert_eq!(expansion.jobs[0].display_name, "Build");
    }

    #[test]
    fn test_scalar_values_render_as_strings() {
        let wf = workflow(
            r#"matrix:
  dimensions:
    node: [18, 20]
    coverage: [true]"#,
        );
        let expansion = MatrixExpander::new().expand(&wf);
        let rendered = expansion.jobs[1].rendered();
        assert_eq!(rendered["node"], "20");
        assert_eq!(rendered["coverage"], "true");
        assert_eq!(expansion.jobs.len(), 2);
    }
}
