use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

fn write_rpc_message(stdin: &mut impl Write, payload: &Value) {
    let body = serde_json::to_vec(payload).unwrap();
    write!(stdin, "Content-Length: {}\r\n\r\n", body.len()).unwrap();
    stdin.write_all(&body).unwrap();
    stdin.flush().unwrap();
}

fn read_rpc_message(stdout: &mut impl BufRead) -> Value {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = stdout.read_line(&mut line).unwrap();
        assert!(n > 0, "unexpected EOF");
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(value.trim().parse::<usize>().unwrap());
            }
        }
    }
    let len = content_length.expect("missing Content-Length");
    let mut buf = vec![0_u8; len];
    stdout.read_exact(&mut buf).unwrap();
    serde_json::from_slice(&buf).unwrap()
}

fn request(id: u64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

#[test]
fn stdio_server_append_cycle_and_audit() {
    let dir = tempfile::tempdir().unwrap();
    let bin = env!("CARGO_BIN_EXE_signalfold-server");
    let mut child = Command::new(bin)
        .env("SIGNALFOLD_DATA_DIR", dir.path())
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());

    write_rpc_message(&mut stdin, &request(1, "initialize", json!({})));
    let init = read_rpc_message(&mut stdout);
    assert_eq!(init["id"], 1);
    assert_eq!(init["result"]["serverInfo"]["name"], "signalfold");

    let gatherings = [
        ("E1", "Lake shore cleanup", -93.26),
        ("E2", "Lake shore cleanup crew", -93.25),
    ];
    for (id, (entity, title, lng)) in gatherings.into_iter().enumerate() {
        write_rpc_message(
            &mut stdin,
            &request(
                10 + id as u64,
                "append",
                json!({
                    "run_id": "scout",
                    "event": {
                        "type": "GatheringDiscovered",
                        "id": entity,
                        "title": title,
                        "lat": 44.97,
                        "lng": lng,
                        "source_url": format!("https://news{id}.example.org/{entity}")
                    }
                }),
            ),
        );
        let appended = read_rpc_message(&mut stdout);
        assert_eq!(appended["result"]["seq"], id + 1);
    }

    // Rejected at the log boundary, nothing appended.
    write_rpc_message(
        &mut stdin,
        &request(
            20,
            "append",
            json!({
                "event": {
                    "type": "GatheringDiscovered",
                    "id": "E3",
                    "title": "x",
                    "lat": "north",
                    "lng": 0
                }
            }),
        ),
    );
    let rejected = read_rpc_message(&mut stdout);
    assert_eq!(rejected["error"]["code"], -32602);

    write_rpc_message(&mut stdin, &request(30, "run_cycle", json!({})));
    let cycle = read_rpc_message(&mut stdout);
    assert_eq!(cycle["id"], 30);
    assert!(cycle["result"]["cycles"].as_u64().unwrap() >= 1);

    write_rpc_message(&mut stdin, &request(31, "status", json!({})));
    let status = read_rpc_message(&mut stdout);
    assert_eq!(status["result"]["lag"], 0);
    assert!(status["result"]["nodes"].as_u64().unwrap() >= 2);

    write_rpc_message(
        &mut stdin,
        &request(32, "audit", json!({ "verify_enrichment": true })),
    );
    let audit = read_rpc_message(&mut stdout);
    assert_eq!(audit["result"]["clean"], true, "{audit}");

    // Stop child cleanly.
    drop(stdin);
    let _ = child.wait();
}

#[test]
fn stdio_server_survives_bad_frame() {
    let dir = tempfile::tempdir().unwrap();
    let bin = env!("CARGO_BIN_EXE_signalfold-server");
    let mut child = Command::new(bin)
        .env("SIGNALFOLD_DATA_DIR", dir.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());

    let garbage = b"{not json";
    write!(stdin, "Content-Length: {}\r\n\r\n", garbage.len()).unwrap();
    stdin.write_all(garbage).unwrap();
    stdin.flush().unwrap();
    let parse_error = read_rpc_message(&mut stdout);
    assert_eq!(parse_error["error"]["code"], -32700);

    write_rpc_message(&mut stdin, &request(2, "ping", json!({})));
    let pong = read_rpc_message(&mut stdout);
    assert_eq!(pong["id"], 2);
    assert!(pong["result"].is_object());

    // An oversized frame is skipped whole; the following request still lands.
    let oversized = vec![b' '; 1_048_577];
    write!(stdin, "Content-Length: {}\r\n\r\n", oversized.len()).unwrap();
    stdin.write_all(&oversized).unwrap();
    stdin.flush().unwrap();
    let too_big = read_rpc_message(&mut stdout);
    assert_eq!(too_big["error"]["code"], -32700);

    write_rpc_message(&mut stdin, &request(3, "ping", json!({})));
    let pong = read_rpc_message(&mut stdout);
    assert_eq!(pong["id"], 3);

    drop(stdin);
    let _ = child.wait();
}
