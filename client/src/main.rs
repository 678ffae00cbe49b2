//! Agent Mesh CLI: POST a message to the gateway and follow the SSE stream
//! until the run's terminal output.
//!
//! Exit codes: 0 ok, 2 timed out waiting for output, 3 send failed, 4 stream
//! connect failed, 5 usage.

mod sse;

use agent_mesh_core::event::StreamEvent;
use clap::Parser;
use futures::StreamExt;
use sse::SseParser;
use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;
use uuid::Uuid;

const EXIT_OK: u8 = 0;
const EXIT_TIMEOUT: u8 = 2;
const EXIT_SEND_FAILED: u8 = 3;
const EXIT_STREAM_FAILED: u8 = 4;
const EXIT_USAGE: u8 = 5;

/// Send a message to an agent and stream the reply.
#[derive(Debug, Parser)]
#[command(name = "agent-mesh-client", version, about)]
struct Args {
    /// Gateway base url.
    #[arg(long, env = "GATEWAY_URL", default_value = "http://127.0.0.1:8080")]
    gateway: String,

    /// Agent to address (`recipient = agent:<name>`).
    #[arg(long, default_value = "assistant")]
    agent: String,

    /// Conversation id; a fresh one is generated when omitted.
    #[arg(long)]
    conversation: Option<String>,

    /// Sender address recorded on the envelope.
    #[arg(long, default_value = "user:cli")]
    sender: String,

    /// Seconds to wait for the terminal output before giving up.
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Print only the final output text.
    #[arg(long)]
    quiet: bool,

    /// Print each event as one raw JSON line instead of rendering.
    #[arg(long)]
    json: bool,

    /// The message to send.
    message: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap writes its own help/error text; the exit code is ours.
            let _ = e.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let conversation_id = args
        .conversation
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let client = reqwest::Client::new();

    // Open the stream before sending so no early events are missed.
    let stream_url = format!("{}/stream/{conversation_id}", args.gateway);
    let stream_response = match client
        .get(&stream_url)
        .header("Accept", "text/event-stream")
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            eprintln!("stream connect failed: {} returned {}", stream_url, response.status());
            return ExitCode::from(EXIT_STREAM_FAILED);
        }
        Err(e) => {
            eprintln!("stream connect failed: {e}");
            return ExitCode::from(EXIT_STREAM_FAILED);
        }
    };

    let body = serde_json::json!({
        "conversation_id": conversation_id,
        "sender": args.sender,
        "recipient": format!("agent:{}", args.agent),
        "type": "message",
        "content": args.message,
    });
    match client
        .post(format!("{}/send", args.gateway))
        .json(&body)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            eprintln!("send failed: {status}: {detail}");
            return ExitCode::from(EXIT_SEND_FAILED);
        }
        Err(e) => {
            eprintln!("send failed: {e}");
            return ExitCode::from(EXIT_SEND_FAILED);
        }
    }

    let follow = follow_stream(stream_response, &args);
    match tokio::time::timeout(Duration::from_secs(args.timeout), follow).await {
        Ok(code) => ExitCode::from(code),
        Err(_) => {
            eprintln!("timed out after {}s waiting for output", args.timeout);
            ExitCode::from(EXIT_TIMEOUT)
        }
    }
}

/// Consume the SSE stream until the terminal output event.
async fn follow_stream(response: reqwest::Response, args: &Args) -> u8 {
    let mut parser = SseParser::new();
    let mut chunks = response.bytes_stream();

    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                eprintln!("stream interrupted: {e}");
                return EXIT_STREAM_FAILED;
            }
        };
        for event in parser.push(&String::from_utf8_lossy(&chunk)) {
            if args.json {
                println!("{}", event.data);
            }
            let Ok(decoded) = StreamEvent::from_payload(&event.data) else {
                continue;
            };
            if !args.json {
                render(&decoded, args.quiet);
            }
            if decoded.is_terminal() {
                return EXIT_OK;
            }
        }
    }

    eprintln!("stream closed before the run completed");
    EXIT_STREAM_FAILED
}

fn render(event: &StreamEvent, quiet: bool) {
    match event {
        StreamEvent::Token { text, .. } => {
            if !quiet {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
        }
        StreamEvent::ToolStep {
            name,
            result_summary,
            ..
        } => {
            if !quiet {
                match result_summary {
                    Some(summary) => eprintln!("[tool {name}] {summary}"),
                    None => eprintln!("[tool {name}] running"),
                }
            }
        }
        StreamEvent::Output { text, .. } => {
            if quiet {
                println!("{text}");
            } else {
                // Tokens already streamed the text; close the line.
                println!();
            }
        }
        StreamEvent::Log {
            level,
            component,
            message,
            ..
        } => {
            if !quiet {
                eprintln!("[{component}:{level:?}] {message}");
            }
        }
        StreamEvent::SignalSend { topic, .. } => {
            if !quiet {
                eprintln!("[signal →] {topic}");
            }
        }
        StreamEvent::SignalRecv { topic, .. } => {
            if !quiet {
                eprintln!("[signal ←] {topic}");
            }
        }
    }
}
