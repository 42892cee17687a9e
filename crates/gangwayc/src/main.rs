use gangway_bridge::{Bridge, BridgeError, TOOL_NAME, VERSION};
use serde::Serialize;
use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::process;

const HELP: &str = "\
Gangway guest evaluator

Usage:
  gangway <guest.wasm> [--eval <text>] [--json]

Evaluates text inside a sandboxed wasm guest module. With --eval the result
is printed once; otherwise lines read from stdin are evaluated one at a time.

Options:
  --eval <text>  Evaluate <text> and exit
  --json         Emit a JSON report instead of plain text
  -h, --help     Show this help message
  --version      Show version information
";

#[derive(Debug, PartialEq, Eq)]
struct Options {
    guest: String,
    eval: Option<String>,
    json: bool,
}

#[derive(Serialize)]
struct EvalReport {
    tool: &'static str,
    version: &'static str,
    ok: bool,
    result: Option<String>,
    error: Option<String>,
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() || args.iter().any(|arg| matches!(arg.as_str(), "-h" | "--help")) {
        print!("{HELP}");
        return;
    }
    if args[0] == "--version" {
        println!("{TOOL_NAME} {VERSION}");
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let options = match parse_options(&args) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!();
            eprintln!("{HELP}");
            process::exit(2);
        }
    };

    if let Err(message) = execute(options) {
        eprintln!("error: {message}");
        process::exit(1);
    }
}

fn parse_options(args: &[String]) -> Result<Options, String> {
    let mut guest = None;
    let mut eval = None;
    let mut json = false;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--eval" => {
                let text = iter.next().ok_or("--eval requires a value")?;
                eval = Some(text.clone());
            }
            "--json" => json = true,
            other if other.starts_with("--") => {
                return Err(format!("unknown option '{other}'"));
            }
            path => {
                if guest.is_some() {
                    return Err(format!("unexpected argument '{path}'"));
                }
                guest = Some(path.to_string());
            }
        }
    }
    let guest = guest.ok_or("missing guest module path")?;
    Ok(Options { guest, eval, json })
}

fn execute(options: Options) -> Result<(), String> {
    let wasm = fs::read(&options.guest)
        .map_err(|err| format!("cannot read '{}': {err}", options.guest))?;
    let mut bridge = Bridge::load(&wasm).map_err(|err| err.to_string())?;

    match options.eval {
        Some(text) => {
            report(&mut io::stdout(), bridge.evaluate(&text), options.json)
                .map_err(|err| err.to_string())
        }
        None => repl(&mut bridge, options.json).map_err(|err| err.to_string()),
    }
}

fn repl(bridge: &mut Bridge, json: bool) -> io::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, ">>> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let source = line.trim_end_matches(['\n', '\r']);
        report(&mut stdout, bridge.evaluate(source), json)?;
    }
}

fn report(
    out: &mut impl Write,
    outcome: Result<String, BridgeError>,
    json: bool,
) -> io::Result<()> {
    if json {
        let report = match &outcome {
            Ok(result) => EvalReport {
                tool: TOOL_NAME,
                version: VERSION,
                ok: true,
                result: Some(result.clone()),
                error: None,
            },
            Err(err) => EvalReport {
                tool: TOOL_NAME,
                version: VERSION,
                ok: false,
                result: None,
                error: Some(err.to_string()),
            },
        };
        let body = serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string());
        writeln!(out, "{body}")
    } else {
        match outcome {
            Ok(result) => writeln!(out, "{result}"),
            Err(err) => writeln!(out, "error: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_guest_path_and_flags() {
        let options = parse_options(&args(&["guest.wasm", "--eval", "id;", "--json"])).unwrap();
        assert_eq!(
            options,
            Options {
                guest: "guest.wasm".to_string(),
                eval: Some("id;".to_string()),
                json: true,
            }
        );
    }

    #[test]
    fn rejects_missing_guest_and_unknown_options() {
        assert!(parse_options(&args(&["--json"])).is_err());
        assert!(parse_options(&args(&["guest.wasm", "--frobnicate"])).is_err());
        assert!(parse_options(&args(&["guest.wasm", "--eval"])).is_err());
        assert!(parse_options(&args(&["a.wasm", "b.wasm"])).is_err());
    }
}
