//! Subcommand drivers: batch checking of a file and the interactive loop.

use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::time::Instant;

use coq_repl::{CoqConfig, CoqSession, Response, Value};
use encoding_rs::Encoding;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

/// Arguments for the `check` subcommand.
#[derive(Debug)]
pub struct CheckArgs {
    pub config: CoqConfig,
    /// File with one sentence per line.
    pub file: PathBuf,
}

/// Arguments for the `repl` subcommand.
#[derive(Debug)]
pub struct ReplArgs {
    pub config: CoqConfig,
}

/// Send every non-empty line of a file as a sentence, stopping at the first
/// one the backend rejects.
pub async fn run_check(args: CheckArgs) -> anyhow::Result<()> {
    let start = Instant::now();
    let source = std::fs::read_to_string(&args.file)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", args.file.display()))?;
    let encoding = args.config.text_encoding()?;

    let mut session = CoqSession::initialize(args.config).await?;
    let outcome = check_sentences(&mut session, &source, encoding).await;
    session.shutdown().await;
    let accepted = outcome?;

    tracing::info!(
        file = %args.file.display(),
        sentences = accepted,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Check finished"
    );
    println!("{}: {accepted} sentence(s) OK", args.file.display());
    Ok(())
}

async fn check_sentences(
    session: &mut CoqSession,
    source: &str,
    encoding: &'static Encoding,
) -> anyhow::Result<usize> {
    let mut accepted = 0;
    for (index, line) in source.lines().enumerate() {
        let sentence = line.trim();
        if sentence.is_empty() {
            continue;
        }
        let line_no = index + 1;
        let response = session
            .advance(sentence, encoding)
            .await
            .map_err(|e| anyhow::anyhow!("line {line_no}: {e}"))?;
        match &response {
            Response::Ok { annotation, .. } => {
                if let Some(text) = annotation {
                    print_annotation(text);
                }
                accepted += 1;
            }
            Response::Err { .. } => {
                let message = response.error_message().unwrap_or_default();
                anyhow::bail!("line {line_no}: {}", message.trim_end());
            }
        }
    }
    Ok(accepted)
}

/// A line typed at the interactive prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Advance(String),
    Undo(usize),
    Goals,
    Query(String),
    History,
    Restart,
    Quit,
}

impl ReplCommand {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> anyhow::Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(directive) = line.strip_prefix(':') else {
            return Ok(Some(Self::Advance(line.to_string())));
        };
        let (name, rest) = match directive.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (directive, ""),
        };
        let command = match name {
            "undo" if rest.is_empty() => Self::Undo(1),
            "undo" => Self::Undo(
                rest.parse()
                    .map_err(|_| anyhow::anyhow!(":undo expects a step count, got {rest:?}"))?,
            ),
            "query" if rest.is_empty() => anyhow::bail!(":query expects a command"),
            "query" => Self::Query(rest.to_string()),
            "goals" => Self::Goals,
            "history" => Self::History,
            "restart" => Self::Restart,
            "quit" | "q" => Self::Quit,
            other => anyhow::bail!("unknown command :{other}"),
        };
        Ok(Some(command))
    }
}

/// Interactive loop on stdin.
pub async fn run_repl(args: ReplArgs) -> anyhow::Result<()> {
    let encoding = args.config.text_encoding()?;
    let mut session = CoqSession::initialize(args.config).await?;
    let interactive = std::io::stdin().is_terminal();

    let result = repl_loop(&mut session, BufReader::new(tokio::io::stdin()), encoding, interactive).await;
    session.shutdown().await;
    result
}

async fn repl_loop<R: AsyncBufRead + Unpin>(
    session: &mut CoqSession,
    input: R,
    encoding: &'static Encoding,
    interactive: bool,
) -> anyhow::Result<()> {
    let mut lines = input.lines();
    loop {
        if interactive {
            print!("coq> ");
            std::io::stdout().flush()?;
        }
        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        let command = match ReplCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        if command == ReplCommand::Quit {
            return Ok(());
        }
        if let Err(e) = execute(session, command, encoding).await {
            eprintln!("error: {e}");
            if !session.is_running() {
                eprintln!("backend is gone; use :restart to launch a new one");
            }
        }
    }
}

async fn execute(
    session: &mut CoqSession,
    command: ReplCommand,
    encoding: &'static Encoding,
) -> anyhow::Result<()> {
    match command {
        ReplCommand::Advance(sentence) => {
            let response = session.advance(&sentence, encoding).await?;
            report(&response);
        }
        ReplCommand::Undo(steps) => {
            let response = session.rewind(steps).await?;
            report(&response);
        }
        ReplCommand::Goals => {
            let response = session.goals(None).await?;
            match response.value() {
                Some(value) => println!("{}", render_goals(value)),
                None => report(&response),
            }
        }
        ReplCommand::Query(text) => {
            let response = session.query(&text, encoding, false).await?;
            report(&response);
        }
        ReplCommand::History => {
            let history: Vec<String> = session.history().iter().map(|s| s.to_string()).collect();
            println!(
                "root {}, current {}, history [{}]",
                session.root_state(),
                session.current_state(),
                history.join(", ")
            );
        }
        ReplCommand::Restart => {
            session.restart().await?;
            println!("restarted at state {}", session.root_state());
        }
        ReplCommand::Quit => {}
    }
    Ok(())
}

fn report(response: &Response) {
    match response {
        Response::Ok { annotation, .. } => {
            if let Some(text) = annotation {
                print_annotation(text);
            }
        }
        Response::Err { .. } => {
            let message = response.error_message().unwrap_or_default();
            eprintln!("{}", message.trim_end());
        }
    }
}

fn print_annotation(text: &str) {
    let text = text.trim_end();
    if !text.is_empty() {
        println!("{text}");
    }
}

/// Plain-text view of a `Goal` reply.
pub fn render_goals(value: &Value) -> String {
    let goals = match value {
        Value::Option(Some(inner)) => match inner.as_ref() {
            Value::Goals(goals) => goals,
            other => return format!("unexpected goals reply: {}", other.kind()),
        },
        Value::Option(None) => return "No proof in progress.".to_string(),
        other => return format!("unexpected goals reply: {}", other.kind()),
    };

    let mut out = String::new();
    if goals.fg.is_empty() {
        out.push_str("No more goals.");
    } else {
        out.push_str(&format!("{} goal(s)", goals.fg.len()));
        for (i, goal) in goals.fg.iter().enumerate() {
            out.push_str(&format!("\n\ngoal {}:", i + 1));
            for hyp in &goal.hypotheses {
                out.push('\n');
                out.push_str(hyp.trim_end());
            }
            out.push_str("\n============================\n");
            out.push_str(goal.conclusion.trim_end());
        }
    }
    let hidden = [
        (goals.bg.len(), "unfocused"),
        (goals.shelved.len(), "shelved"),
        (goals.given_up.len(), "given up"),
    ];
    for (count, label) in hidden {
        if count > 0 {
            out.push_str(&format!("\n({count} {label})"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use coq_repl::{Goal, Goals};

    #[test]
    fn test_parse_sentences_and_blank_lines() {
        assert_eq!(ReplCommand::parse("   ").unwrap(), None);
        assert_eq!(
            ReplCommand::parse("  intros n. ").unwrap(),
            Some(ReplCommand::Advance("intros n.".into()))
        );
    }

    #[test]
    fn test_parse_directives() {
        assert_eq!(ReplCommand::parse(":undo").unwrap(), Some(ReplCommand::Undo(1)));
        assert_eq!(ReplCommand::parse(":undo 3").unwrap(), Some(ReplCommand::Undo(3)));
        assert_eq!(ReplCommand::parse(":goals").unwrap(), Some(ReplCommand::Goals));
        assert_eq!(
            ReplCommand::parse(":query Check   nat.").unwrap(),
            Some(ReplCommand::Query("Check   nat.".into()))
        );
        assert_eq!(ReplCommand::parse(":history").unwrap(), Some(ReplCommand::History));
        assert_eq!(ReplCommand::parse(":restart").unwrap(), Some(ReplCommand::Restart));
        assert_eq!(ReplCommand::parse(":quit").unwrap(), Some(ReplCommand::Quit));
        assert_eq!(ReplCommand::parse(":q").unwrap(), Some(ReplCommand::Quit));
    }

    #[test]
    fn test_parse_rejects_bad_directives() {
        assert!(ReplCommand::parse(":undo many").is_err());
        assert!(ReplCommand::parse(":undo -1").is_err());
        assert!(ReplCommand::parse(":query").is_err());
        assert!(ReplCommand::parse(":frobnicate").is_err());
    }

    #[test]
    fn test_render_goals() {
        let goals = Goals {
            fg: vec![Goal {
                id: 1,
                hypotheses: vec!["n : nat".into()],
                conclusion: "n + 0 = n".into(),
            }],
            bg: vec![Goal {
                id: 2,
                hypotheses: vec![],
                conclusion: "True".into(),
            }],
            ..Default::default()
        };
        let text = render_goals(&Value::some(Value::Goals(goals)));
        assert_eq!(
            text,
            "1 goal(s)\n\ngoal 1:\nn : nat\n============================\nn + 0 = n\n(1 unfocused)"
        );
    }

    #[test]
    fn test_render_no_proof_and_finished_proof() {
        assert_eq!(render_goals(&Value::none()), "No proof in progress.");
        assert_eq!(
            render_goals(&Value::some(Value::Goals(Goals::default()))),
            "No more goals."
        );
    }
}
