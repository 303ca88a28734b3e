//! Dependency discovery and wave construction.
//!
//! Dependencies are discovered statically, by walking unevaluated expression
//! trees for the variable names they mention. Waves are then built with a
//! repeated ready scan: an operation is ready when none of its dependencies
//! is produced by a still-unscheduled operation. Independent operations land
//! in the same wave and run concurrently; a scan that makes no progress
//! means a dependency cycle and fails the whole schedule.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::interpreter::ast::{Expr, ExternalExpr, TemplatePart};

use super::registry::{AsyncOperation, OpRegistry};
use super::{OpId, ScheduleError, ScheduleResult};

/// Variable names an expression depends on, discovered without evaluating
/// anything. Both template placeholder modes count: an expanded placeholder
/// needs the value, a deferred one needs the variable to exist for the
/// collaborator.
pub fn collect_dependencies(expr: &Expr) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    walk(expr, &mut names);
    names
}

fn walk(expr: &Expr, names: &mut BTreeSet<String>) {
    match expr {
        Expr::Null | Expr::Bool(_) | Expr::Number(_) | Expr::Str(_) => {}
        Expr::Template(parts) => {
            for part in parts {
                match part {
                    TemplatePart::Deferred(name) | TemplatePart::Expand(name) => {
                        names.insert(name.clone());
                    }
                    TemplatePart::Text(_) => {}
                }
            }
        }
        Expr::Array(items) => items.iter().for_each(|item| walk(item, names)),
        Expr::Object(entries) => entries.iter().for_each(|(_, value)| walk(value, names)),
        Expr::Identifier(name) => {
            names.insert(name.clone());
        }
        Expr::Member { object, .. } => walk(object, names),
        Expr::Index { object, index } => {
            walk(object, names);
            walk(index, names);
        }
        Expr::Slice { object, start, end } => {
            walk(object, names);
            if let Some(start) = start {
                walk(start, names);
            }
            if let Some(end) = end {
                walk(end, names);
            }
        }
        Expr::Unary { operand, .. } => walk(operand, names),
        Expr::Binary { left, right, .. } => {
            walk(left, names);
            walk(right, names);
        }
        Expr::Call { args, .. } => args.iter().for_each(|arg| walk(arg, names)),
        Expr::External(external) => match external {
            ExternalExpr::ModelCall {
                prompt,
                model,
                context,
            } => {
                walk(prompt, names);
                if let Some(model) = model {
                    walk(model, names);
                }
                context.iter().for_each(|value| walk(value, names));
            }
            ExternalExpr::CodeBlock { params, .. } => {
                names.extend(params.iter().cloned());
            }
            ExternalExpr::ToolCall { args, .. } => {
                args.iter().for_each(|arg| walk(arg, names));
            }
        },
    }
}

/// One group of operations with no dependencies among themselves; all
/// members may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AsyncWave {
    /// Operations in the wave, ordered by id for determinism.
    pub operations: Vec<OpId>,
}

impl AsyncWave {
    /// Number of operations in the wave.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether the wave is empty.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Partition every pending operation into dependency-ordered waves.
///
/// A dependency on a variable no pending operation produces never blocks:
/// those names resolve from the context snapshot at execution time. A cycle
/// fails the entire schedule; no partial wave list comes back.
pub fn build_execution_waves(registry: &OpRegistry) -> ScheduleResult<Vec<AsyncWave>> {
    let mut remaining: Vec<AsyncOperation> = registry
        .pending_ids()
        .into_iter()
        .filter_map(|id| registry.get(id))
        .collect();

    let mut waves = Vec::new();
    while !remaining.is_empty() {
        let blocked_names: BTreeSet<String> = remaining
            .iter()
            .filter_map(|op| op.variable.clone())
            .collect();

        let (ready, rest): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|op| {
            op.dependencies
                .iter()
                .all(|dep| !blocked_names.contains(dep))
        });

        if ready.is_empty() {
            let cycle = rest
                .iter()
                .filter_map(|op| op.variable.clone())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ScheduleError::CircularDependency(cycle));
        }

        let mut operations: Vec<OpId> = ready.into_iter().map(|op| op.id).collect();
        operations.sort_unstable();
        waves.push(AsyncWave { operations });
        remaining = rest;
    }

    debug!(waves = waves.len(), "built execution schedule");
    Ok(waves)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn register(registry: &OpRegistry, var: &str, dependencies: &[&str]) -> OpId {
        registry.register(
            Some(var.to_string()),
            Expr::Identifier("placeholder".into()),
            deps(dependencies),
        )
    }

    fn wave_set(wave: &AsyncWave) -> BTreeSet<OpId> {
        wave.operations.iter().copied().collect()
    }

    #[test]
    fn dependency_discovery_covers_nested_expressions() {
        let expr = Expr::External(ExternalExpr::ModelCall {
            prompt: Box::new(Expr::Template(vec![
                TemplatePart::Text("Use ".into()),
                TemplatePart::Expand("style".into()),
                TemplatePart::Deferred("draft".into()),
            ])),
            model: Some(Box::new(Expr::Identifier("chosen_model".into()))),
            context: vec![Expr::Member {
                object: Box::new(Expr::Identifier("config".into())),
                property: "seed".into(),
            }],
        });
        assert_eq!(
            collect_dependencies(&expr),
            deps(&["style", "draft", "chosen_model", "config"])
        );
    }

    #[test]
    fn code_block_params_are_dependencies() {
        let expr = Expr::External(ExternalExpr::CodeBlock {
            body: "a + b".into(),
            params: vec!["a".into(), "b".into()],
        });
        assert_eq!(collect_dependencies(&expr), deps(&["a", "b"]));
    }

    #[test]
    fn independent_operations_share_one_wave() {
        let registry = OpRegistry::new();
        let a = register(&registry, "a", &[]);
        let b = register(&registry, "b", &[]);

        let waves = build_execution_waves(&registry).unwrap();
        assert_eq!(waves.len(), 1);
        assert_eq!(wave_set(&waves[0]), [a, b].into_iter().collect());
    }

    #[test]
    fn chains_produce_dependency_ordered_waves() {
        let registry = OpRegistry::new();
        let a = register(&registry, "a", &[]);
        let b = register(&registry, "b", &[]);
        let c = register(&registry, "c", &["a"]);
        let d = register(&registry, "d", &["a", "b"]);
        let e = register(&registry, "e", &["c", "d"]);

        let waves = build_execution_waves(&registry).unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(wave_set(&waves[0]), [a, b].into_iter().collect());
        assert_eq!(wave_set(&waves[1]), [c, d].into_iter().collect());
        assert_eq!(wave_set(&waves[2]), [e].into_iter().collect());
    }

    #[test]
    fn plain_variable_dependencies_never_block() {
        let registry = OpRegistry::new();
        // "config" is an ordinary variable, not produced by any operation.
        let a = register(&registry, "a", &["config"]);

        let waves = build_execution_waves(&registry).unwrap();
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].operations, vec![a]);
    }

    #[test]
    fn cycles_fail_without_a_partial_schedule() {
        let registry = OpRegistry::new();
        register(&registry, "a", &["b"]);
        register(&registry, "b", &["a"]);
        register(&registry, "c", &[]);

        // One resolvable operation does not rescue a cyclic schedule.
        let err = build_execution_waves(&registry).unwrap_err();
        match err {
            ScheduleError::CircularDependency(names) => {
                assert!(names.contains('a') && names.contains('b'));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn resolved_operations_drop_out_of_the_schedule() {
        let registry = OpRegistry::new();
        let a = register(&registry, "a", &[]);
        let b = register(&registry, "b", &["a"]);

        registry.mark_running(a).unwrap();
        registry
            .complete(a, crate::interpreter::value::Value::number(1.0))
            .unwrap();

        let waves = build_execution_waves(&registry).unwrap();
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].operations, vec![b]);
    }
}
