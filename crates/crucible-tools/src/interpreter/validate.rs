use serde_json::{Map, Number, Value};

use crucible_types::ToolCall;

use super::ast::{Arg, ArrayItem, Expr, MemberProp, Program, PropKey, Property, Stmt};
use super::InterpreterError;

pub const CALL_TOOL: &str = "callTool";

/// Walks the whole program and returns every `callTool` invocation in source
/// order. Any other call form, or any non-literal argument, rejects the
/// entire program.
pub fn collect_tool_calls(program: &Program) -> Result<Vec<ToolCall>, InterpreterError> {
    let mut calls = Vec::new();
    for stmt in &program.body {
        walk_stmt(stmt, &mut calls)?;
    }
    Ok(calls)
}

fn walk_stmt(stmt: &Stmt, calls: &mut Vec<ToolCall>) -> Result<(), InterpreterError> {
    match stmt {
        Stmt::Expr(expr) => walk_expr(expr, calls),
        Stmt::Decl { bindings, .. } => {
            for (_, init) in bindings {
                if let Some(init) = init {
                    walk_expr(init, calls)?;
                }
            }
            Ok(())
        }
        Stmt::Block(body) => {
            for stmt in body {
                walk_stmt(stmt, calls)?;
            }
            Ok(())
        }
        Stmt::Empty => Ok(()),
    }
}

fn walk_expr(expr: &Expr, calls: &mut Vec<ToolCall>) -> Result<(), InterpreterError> {
    match expr {
        Expr::Call {
            callee,
            args,
            optional,
            offset,
        } => {
            if !optional && matches!(callee.as_ref(), Expr::Ident(name) if name == CALL_TOOL) {
                calls.push(tool_call(args, *offset)?);
                return Ok(());
            }
            Err(InterpreterError::UnsupportedLiteral {
                offset: *offset,
                reason: format!(
                    "call to `{}` is not permitted; only `{CALL_TOOL}(...)` may be invoked",
                    callee.describe()
                ),
            })
        }
        Expr::New { callee, offset, .. } => Err(InterpreterError::UnsupportedLiteral {
            offset: *offset,
            reason: format!("`new {}` is not permitted", callee.describe()),
        }),
        Expr::TaggedTemplate { tag, offset } => Err(InterpreterError::UnsupportedLiteral {
            offset: *offset,
            reason: format!("tagged template `{}` is not permitted", tag.describe()),
        }),
        Expr::Template { substitutions, .. } if *substitutions > 0 => {
            Err(InterpreterError::UnsupportedLiteral {
                offset: 0,
                reason: "template literal with `${...}` substitutions is not a literal".to_string(),
            })
        }
        Expr::Str(_)
        | Expr::Num(_)
        | Expr::Bool(_)
        | Expr::Null
        | Expr::Template { .. }
        | Expr::Ident(_) => Ok(()),
        Expr::Array(items) => {
            for item in items {
                match item {
                    ArrayItem::Item(e) | ArrayItem::Spread(e) => walk_expr(e, calls)?,
                    ArrayItem::Hole => {}
                }
            }
            Ok(())
        }
        Expr::Object(props) => {
            for prop in props {
                match prop {
                    Property::KeyValue { key, value } => {
                        if let PropKey::Computed(key) = key {
                            walk_expr(key, calls)?;
                        }
                        walk_expr(value, calls)?;
                    }
                    Property::Spread(e) => walk_expr(e, calls)?,
                    Property::Shorthand(_) => {}
                }
            }
            Ok(())
        }
        Expr::Unary { arg, .. } | Expr::Update { arg, .. } | Expr::Await(arg) => {
            walk_expr(arg, calls)
        }
        Expr::Binary { left, right, .. } => {
            walk_expr(left, calls)?;
            walk_expr(right, calls)
        }
        Expr::Assign { target, value, .. } => {
            walk_expr(target, calls)?;
            walk_expr(value, calls)
        }
        Expr::Conditional {
            test,
            then,
            otherwise,
        } => {
            walk_expr(test, calls)?;
            walk_expr(then, calls)?;
            walk_expr(otherwise, calls)
        }
        Expr::Sequence(items) => {
            for item in items {
                walk_expr(item, calls)?;
            }
            Ok(())
        }
        Expr::Member { object, prop, .. } => {
            walk_expr(object, calls)?;
            if let MemberProp::Computed(prop) = prop {
                walk_expr(prop, calls)?;
            }
            Ok(())
        }
    }
}

fn tool_call(args: &[Arg], offset: usize) -> Result<ToolCall, InterpreterError> {
    let unsupported = |reason: String| InterpreterError::UnsupportedLiteral { offset, reason };
    if args.is_empty() || args.len() > 2 {
        return Err(unsupported(format!(
            "`{CALL_TOOL}` takes a tool name and at most one argument object, got {} arguments",
            args.len()
        )));
    }
    let tool_name = match &args[0] {
        Arg::Item(Expr::Str(name)) => name.clone(),
        Arg::Item(Expr::Template {
            cooked,
            substitutions: 0,
        }) => cooked.clone(),
        Arg::Item(other) => {
            return Err(unsupported(format!(
                "tool name must be a string literal, found {}",
                other.describe()
            )))
        }
        Arg::Spread(_) => return Err(unsupported("spread arguments are not permitted".into())),
    };
    let args = match args.get(1) {
        None => Value::Object(Map::new()),
        Some(Arg::Item(expr)) => literal_value(expr).map_err(|reason| unsupported(reason))?,
        Some(Arg::Spread(_)) => {
            return Err(unsupported("spread arguments are not permitted".into()))
        }
    };
    Ok(ToolCall { tool_name, args })
}

/// Converts a literal expression to JSON. Anything that could read state or
/// run code is rejected with a reason.
pub fn literal_value(expr: &Expr) -> Result<Value, String> {
    match expr {
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Template {
            cooked,
            substitutions: 0,
        } => Ok(Value::String(cooked.clone())),
        Expr::Template { .. } => Err("template literals with substitutions are not literals".into()),
        Expr::Num(n) => finite_number(*n),
        Expr::Unary { op: "-", arg } => match arg.as_ref() {
            Expr::Num(n) => finite_number(-n),
            other => Err(format!("`-{}` is not a literal", other.describe())),
        },
        Expr::Unary { op: "+", arg } => match arg.as_ref() {
            Expr::Num(n) => finite_number(*n),
            other => Err(format!("`+{}` is not a literal", other.describe())),
        },
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Null => Ok(Value::Null),
        Expr::Array(items) => items
            .iter()
            .map(|item| match item {
                ArrayItem::Item(e) => literal_value(e),
                ArrayItem::Spread(e) => Err(format!("spread of {} is not a literal", e.describe())),
                ArrayItem::Hole => Err("array holes are not literals".into()),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Object(props) => {
            let mut map = Map::new();
            for prop in props {
                match prop {
                    Property::KeyValue { key, value } => {
                        let key = match key {
                            PropKey::Ident(name) | PropKey::Str(name) => name.clone(),
                            PropKey::Num(n) => number_key(*n),
                            PropKey::Computed(_) => {
                                return Err("computed property keys are not literals".into())
                            }
                        };
                        map.insert(key, literal_value(value)?);
                    }
                    Property::Shorthand(name) => {
                        return Err(format!("shorthand property `{name}` references a variable"))
                    }
                    Property::Spread(e) => {
                        return Err(format!("spread of {} is not a literal", e.describe()))
                    }
                }
            }
            Ok(Value::Object(map))
        }
        Expr::Ident(name) => Err(format!("identifier `{name}` is not a literal")),
        other => Err(format!("{} is not a literal", other.describe())),
    }
}

fn finite_number(n: f64) -> Result<Value, String> {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Ok(Value::Number(Number::from(n as i64)));
    }
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| "non-finite numbers are not literals".to_string())
}

fn number_key(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::super::ast::DeclKind;
    use super::super::parser::parse_program;
    use super::*;
    use serde_json::json;

    fn calls(src: &str) -> Result<Vec<ToolCall>, InterpreterError> {
        collect_tool_calls(&parse_program(src)?)
    }

    #[test]
    fn substituted_template_in_a_declaration_fails_closed() {
        let program = Program {
            body: vec![Stmt::Decl {
                kind: DeclKind::Const,
                bindings: vec![(
                    "s".to_string(),
                    Some(Expr::Template {
                        cooked: String::new(),
                        substitutions: 1,
                    }),
                )],
            }],
        };
        let err = collect_tool_calls(&program).unwrap_err();
        assert!(matches!(err, InterpreterError::UnsupportedLiteral { .. }), "{err}");
    }

    #[test]
    fn collects_literal_calls_in_source_order() {
        let found = calls(
            "await callTool('write', {path: 'a.txt', content: `hi`, n: -2, f: 0.5, 'k-1': [true, null]});\n\
             const listing = await callTool(\"list_files\")",
        )
        .expect("valid");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].tool_name, "write");
        assert_eq!(
            found[0].args,
            json!({"path": "a.txt", "content": "hi", "n": -2, "f": 0.5, "k-1": [true, null]})
        );
        assert_eq!(found[1].tool_name, "list_files");
        assert_eq!(found[1].args, json!({}));
    }

    #[test]
    fn rejects_non_literal_arguments() {
        for src in [
            "callTool('x', someFunctionCall())",
            "callTool('x', process.env)",
            "callTool('x', {key: process.env.KEY})",
            "callTool('x', {token})",
            "callTool('x', {...defaults})",
            "callTool('x', {[name]: 1})",
            "callTool('x', [1, , 2])",
            "callTool('x', `a${b}`)",
            "callTool('x', undefined)",
            "callTool('x', -Infinity)",
            "callTool('x', 1 + 2)",
            "callTool(name, {})",
            "callTool('x', {}, 'extra')",
            "callTool()",
            "callTool(...args)",
        ] {
            let err = calls(src).expect_err(src);
            assert!(
                matches!(err, InterpreterError::UnsupportedLiteral { .. }),
                "{src}: {err}"
            );
        }
    }

    #[test]
    fn rejects_any_other_call_form() {
        for src in [
            "console.log('hi')",
            "callTool?.('x')",
            "new Function('return 1')",
            "String.raw`x`",
            "x = fetch('http://example.com')",
            "callTool('ok', {}); eval('1')",
        ] {
            let err = calls(src).expect_err(src);
            assert!(matches!(err, InterpreterError::UnsupportedLiteral { .. }), "{src}");
        }
    }

    #[test]
    fn non_call_expressions_are_inert() {
        let found = calls("const a = 1;\nprocess.env;\ncallTool('x', {n: 1e3})").expect("valid");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].args, json!({"n": 1000}));
    }
}
