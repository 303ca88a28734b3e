use std::collections::HashMap;

use waverun::host::{
    ModuleProvider, ModuleScope, OperationPayload, TypeValidator, TypedValue,
};
use waverun::interpreter::ast::{
    BinaryOp, Expr, ExternalExpr, FunctionDef, Param, Pattern, Program, SourceLoc, Stmt, StmtKind,
    TemplatePart,
};
use waverun::interpreter::state::declare_stmt;
use waverun::interpreter::value::{ErrorInfo, Provenance};
use waverun::interpreter::{
    next_instruction, resume_external, run_until_pause, step_n, step_until_op, ExecStatus,
    RuntimeState, Value,
};

struct TestHost {
    modules: HashMap<String, ModuleScope>,
}

impl TestHost {
    fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }
}

impl ModuleProvider for TestHost {
    fn load_module(&mut self, path: &str) -> anyhow::Result<ModuleScope> {
        self.modules
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no module at '{path}'"))
    }
}

impl TypeValidator for TestHost {
    fn validate(
        &mut self,
        value: Value,
        _declared: Option<&str>,
        _name: &str,
    ) -> Result<TypedValue, ErrorInfo> {
        Ok(TypedValue {
            value,
            inferred_type: None,
        })
    }
}

fn loc(line: u32) -> SourceLoc {
    SourceLoc::new(line, 1)
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn global(state: &RuntimeState, name: &str) -> Value {
    state.frames[0].vars[name].clone()
}

#[test]
fn a_whole_program_runs_through_loops_functions_and_templates() {
    // Collect "3 bottles, 2 bottles, 1 bottles" by counting down in a loop
    // through a function call.
    let program = Program {
        statements: vec![
            declare_stmt("n", Expr::Number(3.0), loc(1)),
            declare_stmt("out", Expr::Str("".into()), loc(2)),
            Stmt::new(
                StmtKind::While {
                    condition: binary(
                        BinaryOp::Gt,
                        Expr::Identifier("n".into()),
                        Expr::Number(0.0),
                    ),
                    body: vec![
                        Stmt::new(
                            StmtKind::Assign {
                                target: "out".into(),
                                expr: binary(
                                    BinaryOp::Add,
                                    Expr::Identifier("out".into()),
                                    Expr::Call {
                                        callee: "label".into(),
                                        args: vec![Expr::Identifier("n".into())],
                                    },
                                ),
                            },
                            loc(4),
                        ),
                        Stmt::new(
                            StmtKind::Assign {
                                target: "n".into(),
                                expr: binary(
                                    BinaryOp::Sub,
                                    Expr::Identifier("n".into()),
                                    Expr::Number(1.0),
                                ),
                            },
                            loc(5),
                        ),
                    ],
                },
                loc(3),
            ),
        ],
        functions: vec![FunctionDef {
            name: "label".into(),
            params: vec![Param {
                name: "count".into(),
                declared_type: None,
            }],
            return_type: None,
            body: vec![Stmt::new(
                StmtKind::Return(Some(Expr::Template(vec![
                    TemplatePart::Expand("count".into()),
                    TemplatePart::Text(" bottles, ".into()),
                ]))),
                loc(7),
            )],
        }],
    };

    let mut host = TestHost::new();
    let state = run_until_pause(RuntimeState::new(program), &mut host);
    assert_eq!(state.status, ExecStatus::Completed);
    assert_eq!(
        global(&state, "out").as_str(),
        Some("3 bottles, 2 bottles, 1 bottles, ")
    );
    assert_eq!(state.frames.len(), 1);
    assert!(state.values.is_empty());
}

#[test]
fn suspension_preserves_partial_evaluation_state() {
    // The external call sits in the middle of an array literal; the scratch
    // values evaluated before it must survive the suspension.
    let program = Program {
        statements: vec![declare_stmt(
            "triple",
            Expr::Array(vec![
                Expr::Number(1.0),
                Expr::External(ExternalExpr::ToolCall {
                    name: "fetch".into(),
                    args: vec![Expr::Str("key".into())],
                }),
                Expr::Number(3.0),
            ]),
            loc(1),
        )],
        functions: Vec::new(),
    };

    let mut host = TestHost::new();
    let mut state = run_until_pause(RuntimeState::new(program), &mut host);
    assert_eq!(state.status, ExecStatus::AwaitingExternal);

    let pending = state.pending_external.clone().expect("pending request");
    match pending.payload {
        OperationPayload::Invocation { name, args } => {
            assert_eq!(name, "fetch");
            assert_eq!(args[0].as_str(), Some("key"));
        }
        other => panic!("unexpected payload {other:?}"),
    }
    // The first array element is already on the scratch stack.
    assert_eq!(state.values.len(), 1);

    resume_external(&mut state, Value::number(2.0));
    let state = run_until_pause(state, &mut host);
    assert_eq!(state.status, ExecStatus::Completed);
    assert_eq!(
        global(&state, "triple").to_json(),
        serde_json::json!([1, 2, 3])
    );
}

#[test]
fn external_metadata_survives_assignment_but_not_copies() {
    let program = Program {
        statements: vec![
            declare_stmt(
                "raw",
                Expr::External(ExternalExpr::ModelCall {
                    prompt: Box::new(Expr::Str("go".into())),
                    model: None,
                    context: vec![],
                }),
                loc(1),
            ),
            declare_stmt("copy", Expr::Identifier("raw".into()), loc(2)),
        ],
        functions: Vec::new(),
    };

    let mut host = TestHost::new();
    let mut state = run_until_pause(RuntimeState::new(program), &mut host);
    assert_eq!(state.status, ExecStatus::AwaitingExternal);

    let mut produced = Value::string("result");
    produced.meta = Some(Default::default());
    resume_external(&mut state, produced);
    let state = run_until_pause(state, &mut host);

    let raw = global(&state, "raw");
    assert_eq!(raw.provenance, Provenance::External);
    assert!(raw.meta.is_some());
    let copy = global(&state, "copy");
    assert_eq!(copy.provenance, Provenance::External);
    assert!(copy.meta.is_none());
}

#[test]
fn constants_reject_reassignment_with_a_located_error() {
    let program = Program {
        statements: vec![
            Stmt::new(
                StmtKind::Declare {
                    pattern: Pattern::Name("limit".into()),
                    declared_type: None,
                    constant: true,
                    deferred: false,
                    init: Expr::Number(10.0),
                },
                loc(1),
            ),
            Stmt::new(
                StmtKind::Assign {
                    target: "limit".into(),
                    expr: Expr::Number(11.0),
                },
                loc(9),
            ),
        ],
        functions: Vec::new(),
    };
    let mut host = TestHost::new();
    let state = run_until_pause(RuntimeState::new(program), &mut host);
    assert_eq!(state.status, ExecStatus::Error);
    let message = state.fatal.clone().expect("fatal message");
    assert!(message.contains("limit"));
    assert!(message.contains("line 9"));
    // The constant keeps its original value.
    assert_eq!(global(&state, "limit").as_number(), Some(10.0));
}

#[test]
fn error_values_steer_branches_through_the_falsy_path() {
    // Reading a missing field produces an error-flagged value; branching on
    // it takes the alternate without terminating the run.
    let program = Program {
        statements: vec![
            declare_stmt(
                "config",
                Expr::Object(vec![("present".into(), Expr::Bool(true))]),
                loc(1),
            ),
            declare_stmt(
                "flag",
                Expr::Member {
                    object: Box::new(Expr::Identifier("config".into())),
                    property: "absent".into(),
                },
                loc(2),
            ),
            declare_stmt("path", Expr::Str("unset".into()), loc(3)),
            Stmt::new(
                StmtKind::If {
                    condition: Expr::Identifier("flag".into()),
                    consequent: vec![Stmt::new(
                        StmtKind::Assign {
                            target: "path".into(),
                            expr: Expr::Str("then".into()),
                        },
                        loc(5),
                    )],
                    alternate: Some(vec![Stmt::new(
                        StmtKind::Assign {
                            target: "path".into(),
                            expr: Expr::Str("else".into()),
                        },
                        loc(7),
                    )]),
                },
                loc(4),
            ),
        ],
        functions: Vec::new(),
    };
    let mut host = TestHost::new();
    let state = run_until_pause(RuntimeState::new(program), &mut host);
    assert_eq!(state.status, ExecStatus::Completed);
    assert!(global(&state, "flag").is_error());
    assert_eq!(global(&state, "path").as_str(), Some("else"));
}

#[test]
fn errors_propagate_through_expressions_keeping_the_leftmost() {
    let program = Program {
        statements: vec![
            declare_stmt("none", Expr::Null, loc(1)),
            // (null + 1) * 2: the inner null-arithmetic error wins.
            declare_stmt(
                "poisoned",
                binary(
                    BinaryOp::Mul,
                    binary(
                        BinaryOp::Add,
                        Expr::Identifier("none".into()),
                        Expr::Number(1.0),
                    ),
                    Expr::Number(2.0),
                ),
                loc(2),
            ),
        ],
        functions: Vec::new(),
    };
    let mut host = TestHost::new();
    let state = run_until_pause(RuntimeState::new(program), &mut host);
    assert_eq!(state.status, ExecStatus::Completed);
    let poisoned = global(&state, "poisoned");
    assert!(poisoned.is_error());
}

#[test]
fn stepping_can_stop_at_any_instruction_boundary() {
    let program = Program {
        statements: vec![
            declare_stmt("a", Expr::Number(1.0), loc(1)),
            declare_stmt(
                "b",
                binary(
                    BinaryOp::Add,
                    Expr::Identifier("a".into()),
                    Expr::Number(2.0),
                ),
                loc(2),
            ),
        ],
        functions: Vec::new(),
    };
    let mut host = TestHost::new();

    // Stop right before the addition applies; "a" is bound, "b" is not.
    let state = step_until_op(RuntimeState::new(program), &mut host, "apply-binary");
    assert_eq!(state.status, ExecStatus::Running);
    assert_eq!(
        next_instruction(&state).expect("instruction").kind.name(),
        "apply-binary"
    );
    assert_eq!(state.frames[0].vars["a"].as_number(), Some(1.0));
    assert!(!state.frames[0].vars.contains_key("b"));

    // Two more steps: apply and declare.
    let state = step_n(state, &mut host, 2);
    assert_eq!(state.frames[0].vars["b"].as_number(), Some(3.0));
}

#[test]
fn module_functions_cannot_reach_caller_scope() {
    let mut module = ModuleScope::default();
    module
        .globals
        .insert("greeting".into(), Value::string("hello from lib"));
    module.functions.insert(
        "greet".into(),
        FunctionDef {
            name: "greet".into(),
            params: vec![],
            return_type: None,
            body: vec![Stmt::new(
                StmtKind::Return(Some(Expr::Identifier("greeting".into()))),
                loc(1),
            )],
        },
    );
    module.functions.insert(
        "spy".into(),
        FunctionDef {
            name: "spy".into(),
            params: vec![],
            return_type: None,
            body: vec![Stmt::new(
                StmtKind::Return(Some(Expr::Identifier("secret".into()))),
                loc(2),
            )],
        },
    );

    let mut host = TestHost::new();
    host.modules.insert("lib/greet".into(), module);

    let program = Program {
        statements: vec![
            Stmt::new(
                StmtKind::Import {
                    path: "lib/greet".into(),
                    alias: "greet".into(),
                },
                loc(1),
            ),
            declare_stmt("secret", Expr::Str("caller-only".into()), loc(2)),
            declare_stmt(
                "message",
                Expr::Call {
                    callee: "greet.greet".into(),
                    args: vec![],
                },
                loc(3),
            ),
            declare_stmt(
                "stolen",
                Expr::Call {
                    callee: "greet.spy".into(),
                    args: vec![],
                },
                loc(4),
            ),
        ],
        functions: Vec::new(),
    };
    let state = run_until_pause(RuntimeState::new(program), &mut host);

    // The module read its own global, then failed to read the caller's.
    assert_eq!(state.status, ExecStatus::Error);
    assert!(state.fatal.clone().expect("fatal message").contains("secret"));
    assert_eq!(
        global(&state, "message").as_str(),
        Some("hello from lib")
    );
}
