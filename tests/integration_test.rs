use std::{
    collections::hash_map::DefaultHasher,
    f64::consts::{PI, SQRT_2},
    hash::{Hash, Hasher},
};

use assert_approx_eq::assert_approx_eq;
use mathc::{
    compile, parse, parser::ParseErrorKind, tokenizer::TokenType, Backend, CompileError, Context,
    Error, EvaluationError, Node, Operator,
};

fn test_valid_expression(source: &str, expected: f64) {
    let context = Context::with_builtins();
    for backend in Backend::ALL {
        let evaluator =
            compile(source, source, backend).expect("Compile should work on valid expression");
        let actual = evaluator
            .invoke(&context)
            .expect("Evaluate should work with builtins");
        assert_approx_eq!(actual, expected, 1e-5);
    }
}

fn hash(node: &Node) -> u64 {
    let mut hasher = DefaultHasher::new();
    node.hash(&mut hasher);
    hasher.finish()
}

#[test]
fn test_precedence() {
    test_valid_expression("2 + 1 * 5", 7.0);
    test_valid_expression("(2 + 1) * 5", 15.0);
    test_valid_expression("10 - 4 - 3", 3.0);
    test_valid_expression("2 * -3 ^ 2", 18.0);
}

#[test]
fn test_trigonometry() {
    test_valid_expression("sin(pi)", 0.0);
    test_valid_expression("sin(pi / 2)", 1.0);
    test_valid_expression("cos(pi / 4) * 8.0", SQRT_2 * 4.0);
    test_valid_expression("4.0 * sin(pi / 4) * 8.0 + 1.0", SQRT_2 * 16.0 + 1.0);
}

#[test]
fn test_exponent() {
    test_valid_expression("4 ^ 7", 4.0f64.powf(7.0));
    test_valid_expression("4 ^ (7 + 2)", 4.0f64.powf(9.0));
    test_valid_expression("4 ^ (7 + 2) ^ 1.5", 4.0f64.powf(9.0f64.powf(1.5)));
}

#[test]
fn test_builtin_functions() {
    test_valid_expression("max(2, 3) + min(2, 3)", 5.0);
    test_valid_expression("clamp(lerp(0.5, 0, 10), 0, 4)", 4.0);
    test_valid_expression("round(2.5) + round(3.5)", 6.0);
    test_valid_expression("180 * degToRad", PI);
    test_valid_expression("atan2(1, 1) * radToDeg", 45.0);
}

#[test]
fn test_backends_agree_on_nested_calls() {
    let mut context = Context::with_builtins();
    context.register_variable("x", 0.75).unwrap();
    context
        .register_function("mean", |p: &[f64]| p.iter().sum::<f64>() / p.len() as f64)
        .unwrap();

    let source = "mean(sin(x), mean(1, 2, 3, 4, 5, 6, 7, 8, 9, x), -cos(x) ^ 2, mean(x)) % 1";
    let results = Backend::ALL
        .iter()
        .map(|backend| compile("nested", source, *backend).unwrap().invoke(&context).unwrap())
        .collect::<Vec<_>>();
    for result in &results[1..] {
        assert_approx_eq!(*result, results[0], 1e-5);
    }
}

#[test]
fn test_structural_equality() {
    assert_eq!(parse("sin(pi / 2)").unwrap(), parse("sin(pi / 2)").unwrap());
    assert_eq!(
        hash(&parse("sin(pi / 2)").unwrap()),
        hash(&parse("sin(pi / 2)").unwrap())
    );
    assert_eq!(parse("1+2").unwrap(), parse(" 1 +   2 ").unwrap());

    let different = [
        ("sin(pi / 2)", "sin(pi / 4)"),
        ("cos(pi / 2)", "sin(pi / 2)"),
        ("+1.0", "+2.0"),
        ("a + b", "a - b"),
        ("x", "y"),
    ];
    for (a, b) in different {
        let a = parse(a).unwrap();
        let b = parse(b).unwrap();
        assert_ne!(a, b);
        assert_ne!(hash(&a), hash(&b));
    }
}

#[test]
fn test_parse_builds_expected_tree() {
    assert_eq!(
        parse("-x ^ 2").unwrap(),
        Node::operator(
            Operator::Exponent,
            Node::unary(Operator::Minus, Node::variable("x")),
            Node::number(2.0),
        )
    );
}

#[test]
fn test_unknown_variable_is_an_evaluation_error() {
    for backend in Backend::ALL {
        let evaluator = compile("undefined", "undefinedVar", backend)
            .expect("Unknown identifiers should still compile");
        assert_eq!(
            evaluator.invoke(&Context::with_builtins()),
            Err(EvaluationError::UnknownVariable("undefinedVar".to_string()))
        );

        let mut context = Context::with_builtins();
        context.register_variable("undefinedVar", 3.5).unwrap();
        assert_eq!(evaluator.invoke(&context), Ok(3.5));
    }
}

#[test]
fn test_unknown_function_is_an_evaluation_error() {
    for backend in Backend::ALL {
        let evaluator = compile("undefined", "nope(1, 2)", backend).unwrap();
        assert_eq!(
            evaluator.invoke(&Context::new()),
            Err(EvaluationError::UnknownFunction("nope".to_string()))
        );
    }
}

#[test]
fn test_trailing_tokens_fail_to_parse() {
    let error = parse("4 5").unwrap_err();
    assert_eq!(error.expected(), Some(TokenType::Eof));
    assert_eq!(error.found(), TokenType::Number);
    assert!(matches!(
        compile("trailing", "4 5", Backend::Native),
        Err(Error::Parse(_))
    ));
}

#[test]
fn test_missing_paren_fails_to_parse() {
    let error = parse("sin(pi").unwrap_err();
    assert_eq!(error.expected(), Some(TokenType::RightParen));
    assert_eq!(error.found(), TokenType::Eof);
}

#[test]
fn test_invalid_input_fails_to_parse() {
    for source in ["", "1 +", "(1", "1 $ 2", "f(1,)", "*2"] {
        assert!(parse(source).is_err(), "{:?} should not parse", source);
    }
    assert!(matches!(
        parse(&"(".repeat(10_000)).unwrap_err().kind,
        ParseErrorKind::TooDeep
    ));
}

#[test]
fn test_invalid_tree_fails_to_compile() {
    let tree = Node::unary(Operator::Divide, Node::number(1.0));
    for backend in Backend::ALL {
        assert_eq!(
            backend.compiler().compile("invalid", &tree).unwrap_err(),
            CompileError::UnknownUnaryOperator(Operator::Divide)
        );
    }
}

#[test]
fn test_idempotence() {
    let context = Context::with_builtins();
    for backend in Backend::ALL {
        let evaluator = compile("twice", "4.0 * sin(pi / 4) * 8.0 + 1.0", backend).unwrap();
        let first = evaluator.invoke(&context).unwrap();
        let second = evaluator.invoke(&Context::with_builtins()).unwrap();
        assert_eq!(first.to_bits(), second.to_bits());
        assert_eq!(evaluator.name(), "twice");
        assert_eq!(evaluator.backend(), backend);
    }
}

#[test]
fn test_concurrent_invocation() {
    let mut context = Context::with_builtins();
    context.register_variable("x", 2.0).unwrap();
    let context = &context;

    let mut context_with_f = Context::with_builtins();
    context_with_f.register_variable("x", 2.0).unwrap();
    context_with_f.register_function("f", |p: &[f64]| p[0] * 10.0).unwrap();
    let context_with_f = &context_with_f;

    for backend in Backend::ALL {
        let evaluator = &compile("shared", "max(x ^ 3, sqrt(x)) + f(1)", backend).unwrap();
        std::thread::scope(|scope| {
            let handles = (0..8)
                .map(|_| {
                    scope.spawn(move || {
                        (0..100)
                            .map(|_| evaluator.invoke(context_with_f))
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            for handle in handles {
                for result in handle.join().unwrap() {
                    assert_eq!(result, Ok(18.0));
                }
            }
        });
        assert_eq!(
            evaluator.invoke(context),
            Err(EvaluationError::UnknownFunction("f".to_string()))
        );
    }
}

#[test]
fn test_tall_trees_compile_on_every_backend() {
    let sources = [
        (vec!["1"; 2100].join(" + "), 2100.0),
        (vec!["x"; 5000].join(" + "), 2500.0),
        (vec!["x"; 5000].join(" - "), -2499.0),
        (format!("{} * x", vec!["1"; 2000].join(" ^ ")), 0.5),
        (format!("{}x", "-".repeat(5001)), -0.5),
        (format!("max({}, 1)", vec!["x * 2"; 3000].join(" % ")), 1.0),
    ];

    // Spawned threads get the default stack size, smaller than the main thread's
    std::thread::spawn(move || {
        let mut context = Context::with_builtins();
        context.register_variable("x", 0.5).unwrap();
        for (source, expected) in &sources {
            for backend in Backend::ALL {
                let evaluator = compile("tall", source, backend).unwrap();
                assert_eq!(evaluator.invoke(&context), Ok(*expected), "{}", backend);
            }
        }
    })
    .join()
    .unwrap();
}
