//! Scriptable stand-in for the external analysis tool, used by integration
//! tests. The document text it receives on stdin doubles as its script: the
//! first line is a directive telling the stub how to behave.

use std::{
    env,
    io::{self, Read, Write},
    process, thread,
    time::Duration,
};

fn parse_u64(value: &str, directive: &str) -> u64 {
    value.parse().unwrap_or_else(|_| {
        eprintln!("invalid number in directive {directive}: {value}");
        process::exit(64);
    })
}

fn write_repeated(mut writer: impl Write, mut bytes: usize) -> io::Result<()> {
    let buf = [b'a'; 8 * 1024];
    while bytes > 0 {
        let n = bytes.min(buf.len());
        writer.write_all(&buf[..n])?;
        bytes -= n;
    }
    writer.flush()
}

fn spawn_child_sleep(ms: u64) {
    let exe = env::current_exe().unwrap_or_else(|err| {
        eprintln!("failed to resolve current exe: {err}");
        process::exit(64);
    });

    let _child = process::Command::new(exe)
        .args(["--child-sleep-ms", &ms.to_string()])
        .stdin(process::Stdio::null())
        .spawn()
        .unwrap_or_else(|err| {
            eprintln!("failed to spawn child: {err}");
            process::exit(64);
        });
}

fn emit_findings(count: u64, fixes_report: bool) {
    let entries: Vec<String> = (1..=count)
        .map(|i| {
            if fixes_report {
                format!(r#"{{"line":{i},"replacement":""}}"#)
            } else {
                format!(r#"{{"source":"Stub.Rule","line":{i},"column":1,"message":"finding {i}"}}"#)
            }
        })
        .collect();
    let list = entries.join(",");
    if fixes_report {
        println!(r#"{{"edits":[{list}]}}"#);
    } else {
        println!(r#"{{"diagnostics":[{list}],"codeActions":[]}}"#);
    }
    // Real tools in this family exit nonzero when findings are present.
    if count > 0 {
        process::exit(1);
    }
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    // Secret argv form used when the stub re-spawns itself to test
    // process-tree kills: no stdin script, just sleep.
    if let [flag, ms] = args.as_slice() {
        if flag == "--child-sleep-ms" {
            thread::sleep(Duration::from_millis(parse_u64(ms, flag)));
            return;
        }
    }

    let fixes_report = args.iter().any(|arg| arg == "--report=fixes");

    let mut input = String::new();
    if io::stdin().read_to_string(&mut input).is_err() {
        eprintln!("failed to read stdin");
        process::exit(64);
    }

    let directive = input.lines().next().unwrap_or("").trim();

    if directive == "echo-args" {
        let rendered: Vec<String> = args.iter().map(|a| format!("\"{a}\"")).collect();
        println!(r#"{{"diagnostics":[{{"args":[{}]}}]}}"#, rendered.join(","));
        return;
    }
    if directive == "malformed" {
        println!("ERROR: this is not JSON");
        return;
    }

    match directive.split_once(':') {
        Some(("findings", count)) => {
            emit_findings(parse_u64(count, "findings"), fixes_report);
        }
        Some(("exit", rest)) => {
            let (code, message) = rest.split_once(':').unwrap_or((rest, ""));
            if !message.is_empty() {
                eprintln!("{message}");
            }
            process::exit(parse_u64(code, "exit") as i32);
        }
        Some(("sleep", ms)) => {
            thread::sleep(Duration::from_millis(parse_u64(ms, "sleep")));
        }
        Some(("tree-sleep", ms)) => {
            let ms = parse_u64(ms, "tree-sleep");
            spawn_child_sleep(ms);
            thread::sleep(Duration::from_millis(ms));
        }
        Some(("big", bytes)) => {
            let bytes = parse_u64(bytes, "big") as usize;
            write_repeated(io::stdout().lock(), bytes).unwrap();
        }
        // Empty script or unknown directive: a clean run with no findings.
        _ => {}
    }
}
