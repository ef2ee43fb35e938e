use std::io::Write;

use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use mathc::{
    compiler::{NativeCompiler, TreeIrCompiler},
    tokenizer::{tokens, TokenType},
    Backend, Context, EvaluationError, RegistrationError,
};

#[derive(Debug, Parser)]
#[command(about = "Compile and evaluate arithmetic expressions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Backend used to compile expressions
    #[arg(long, global = true, default_value_t = Backend::Native)]
    backend: Backend,

    /// Log compiler decisions
    #[arg(long, global = true)]
    debug: bool,
}

impl Cli {
    pub fn command(&self) -> &Command {
        self.command.as_ref().unwrap_or(&Command::Repl)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate one expression per line
    Repl,
    /// Evaluate a single expression
    Eval(EvalArgs),
    /// Print the token table
    Tokens(ExpressionArgs),
    /// Print the parsed tree, and its IR with `--backend tree-ir`
    Tree(ExpressionArgs),
    /// Print the bytecode of the native backend
    Disassemble(ExpressionArgs),
}

#[derive(Debug, Args)]
struct EvalArgs {
    expression: String,

    /// Define a variable, as `name=value`
    #[arg(short = 'D', value_parser = parse_define)]
    define: Vec<(String, f64)>,
}

#[derive(Debug, Args)]
struct ExpressionArgs {
    expression: String,
}

fn parse_define(s: &str) -> Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, found \"{}\"", s))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid value for {}: {}", name, e))?;
    Ok((name.trim().to_string(), value))
}

fn main() {
    let args = Cli::parse();

    let log_level = if args.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .filter_level(log_level)
        .init();

    let result = match args.command() {
        Command::Repl => {
            repl_command(args.backend);
            Ok(())
        }
        Command::Eval(eval_args) => eval_command(args.backend, eval_args),
        Command::Tokens(expression_args) => {
            tokens_command(expression_args);
            Ok(())
        }
        Command::Tree(expression_args) => tree_command(args.backend, expression_args),
        Command::Disassemble(expression_args) => disassemble_command(expression_args),
    };

    if let Err(e) = result {
        println!("Error: {}", e);
        std::process::exit(1);
    }
}

fn repl_command(backend: Backend) {
    println!("Welcome to the mathc REPL! Compiling with the {} backend.", backend);
    println!("EOF to exit. (Ctrl+D on *nix, Ctrl+Z on Windows)");

    let context = Context::with_builtins();
    loop {
        let mut input = String::new();

        print!("> ");
        std::io::stdout()
            .flush()
            .expect("should be able to flush stdout");

        let read = std::io::stdin()
            .read_line(&mut input)
            .expect("should be able to read line from stdin");

        if read == 0 {
            break;
        }

        let source = input.trim();
        if source.is_empty() {
            continue;
        }
        match interpret(backend, source, &context) {
            Ok(value) => println!("{}", value),
            Err(e) => println!("Error: {}", e),
        }
    }
}

fn eval_command(backend: Backend, args: &EvalArgs) -> Result<(), InterpretError> {
    let mut context = Context::with_builtins();
    for (name, value) in &args.define {
        context.register_variable(name.as_str(), *value)?;
    }
    println!("{}", interpret(backend, &args.expression, &context)?);
    Ok(())
}

fn tokens_command(args: &ExpressionArgs) {
    for token in tokens(&args.expression) {
        println!(
            "{:<10} {:<12} {}",
            token.span.to_string(),
            format!("{:?}", token.token_type),
            token.lexeme.unwrap_or("")
        );

        if token.token_type == TokenType::Eof {
            break;
        }
    }
}

fn tree_command(backend: Backend, args: &ExpressionArgs) -> Result<(), InterpretError> {
    let tree = mathc::parse(&args.expression).map_err(mathc::Error::from)?;
    println!("{}", tree);
    if backend == Backend::TreeIr {
        let expr = TreeIrCompiler.lower(&tree).map_err(mathc::Error::from)?;
        println!("{}", expr);
    }
    Ok(())
}

fn disassemble_command(args: &ExpressionArgs) -> Result<(), InterpretError> {
    let tree = mathc::parse(&args.expression).map_err(mathc::Error::from)?;
    let chunk = NativeCompiler
        .chunk("expression", &tree)
        .map_err(mathc::Error::from)?;
    print!("{}", chunk);
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum InterpretError {
    #[error(transparent)]
    Compile(#[from] mathc::Error),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

fn interpret(backend: Backend, source: &str, context: &Context) -> Result<f64, InterpretError> {
    let evaluator = mathc::compile("expression", source, backend)?;
    Ok(evaluator.invoke(context)?)
}
