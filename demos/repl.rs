use cellscheme::ast::{Value, describe_value};
use cellscheme::scheme::{ParseConfig, parse_scheme_with_config};
use cellscheme::{Error, Interpreter, ParseErrorKind};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::panic;
use std::process;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let result = panic::catch_unwind(|| {
        run_repl();
    });

    if let Err(panic_info) = result {
        eprintln!("The REPL encountered an unexpected error and must exit.");

        if let Some(msg) = panic_info.downcast_ref::<&str>() {
            eprintln!("Error: {msg}");
        } else if let Some(msg) = panic_info.downcast_ref::<String>() {
            eprintln!("Error: {msg}");
        } else {
            eprintln!("Error: Unknown panic occurred");
        }

        process::exit(1);
    }
}

fn run_repl() {
    println!("cellscheme interpreter");
    println!("Enter S-expressions like: (+ 1 2)");
    println!("Type :help for more commands, or Ctrl+C to exit.");
    println!();

    let mut rl = DefaultEditor::new().expect("Could not initialize REPL");
    let mut interp = Interpreter::new();
    let config = ParseConfig {
        handle_comments: true,
    };

    // Lines of an expression still waiting for its closing parentheses
    let mut pending = String::new();

    loop {
        let prompt = if pending.is_empty() { "scheme> " } else { "   ...> " };
        match rl.readline(prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() && pending.is_empty() {
                    continue;
                }

                // Add the line to history
                let _ = rl.add_history_entry(line);

                // Handle special commands
                if pending.is_empty() {
                    match line {
                        ":help" => {
                            print_help();
                            continue;
                        }
                        ":env" => {
                            print_environment(&interp);
                            continue;
                        }
                        ":stats" => {
                            print_stats(&interp);
                            continue;
                        }
                        ":gc" => {
                            let freed = interp.collect();
                            println!("Freed {freed} nodes, {} live", interp.heap().len());
                            continue;
                        }
                        ":quit" | ":exit" => {
                            println!("Goodbye!");
                            break;
                        }
                        _ => {}
                    }
                }

                pending.push_str(line);
                pending.push('\n');

                let result = match parse_scheme_with_config(&pending, interp.heap_mut(), config) {
                    // Keep reading until the expression is complete
                    Err(Error::ParseError(e)) if e.kind == ParseErrorKind::Incomplete => continue,
                    Ok(expr) => interp.evaluate(expr),
                    Err(e) => Err(e),
                };
                pending.clear();

                match result {
                    Ok(text) => println!("{text}"),
                    Err(e) => println!("Error: {e}"),
                }
            }

            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
}

fn print_help() {
    println!("cellscheme interpreter:");
    println!("  :help      - Show this help message");
    println!("  :env       - Show root environment bindings");
    println!("  :stats     - Show heap and collector statistics");
    println!("  :gc        - Run a collection now");
    println!("  :quit      - Exit the interpreter");
    println!("  :exit      - Exit the interpreter");
    println!("  Ctrl+C     - Exit the interpreter");
    println!();
    println!("Supported operations:");
    println!("  Numbers: 42, -5");
    println!("  Booleans: #t/#f (only #f is false)");
    println!("  Arithmetic: +, -, *, /, min, max, abs");
    println!("  Comparison: =, <, >, <=, >=");
    println!("  Logic: and, or, not");
    println!("  Lists: cons, car, cdr, list, list-ref, list-tail, set-car!, set-cdr!");
    println!("  Predicates: number?, boolean?, symbol?, null?, pair?, list?");
    println!("  Definitions: define, set!, lambda, if, quote");
    println!();
    println!("Examples:");
    println!("  (define (fact n) (if (= n 0) 1 (* n (fact (- n 1)))))");
    println!("  (fact 10)");
    println!("  (define l '(1 2 3))");
    println!("  (set-car! l 10)");
    println!();
    println!("Set RUST_LOG=cellscheme=debug to trace collections.");
    println!();
}

fn print_stats(interp: &Interpreter) {
    let stats = interp.stats();
    println!("Live nodes:      {}", interp.heap().len());
    println!("Peak nodes:      {}", stats.peak_nodes);
    println!("Collections:     {}", stats.collections);
    println!("Total allocated: {}", stats.total_allocated);
    println!("Total freed:     {}", stats.total_freed);
}

fn print_environment(interp: &Interpreter) {
    let bindings = interp.global_bindings();

    if bindings.is_empty() {
        println!("Environment is empty.");
        return;
    }

    println!("Environment bindings ({} total):", bindings.len());
    println!();

    // Separate built-in operations from user-defined values
    let mut builtins = Vec::new();
    let mut user_defined = Vec::new();

    for (name, value) in bindings {
        match value.map(|id| interp.heap().get(id)) {
            Some(Value::Builtin(_)) => builtins.push(name),
            _ => user_defined.push((name, value)),
        }
    }

    // Print built-in operations
    if !builtins.is_empty() {
        println!("Built-in operations ({}):", builtins.len());
        // Print in columns for readability
        let mut col = 0;
        for name in builtins {
            print!("  {name:<15}");
            col += 1;
            if col % 4 == 0 {
                println!();
            }
        }
        if col % 4 != 0 {
            println!();
        }
        println!();
    }

    // Print user-defined values
    if !user_defined.is_empty() {
        println!("User-defined values ({}):", user_defined.len());
        for (name, value) in user_defined {
            println!("  {name} = {}", describe_value(interp.heap(), value));
        }
    }
}
