use std::path::Path;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    codec::{CodecError, LineCodec},
    message::{DELIMITER, Message, SYSTEM_AUTHOR, decode_avatar},
};

type Inbound = FramedRead<OwnedReadHalf, LineCodec>;
type Outbound = FramedWrite<OwnedWriteHalf, LineCodec>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut session = Session::new(&args.nickname)?;
    let (mut inbound, mut outbound) = establish_connection(&args).await?;

    if let Some(path) = &args.avatar {
        let avatar = session.load_avatar(path).await?;
        outbound.send(avatar).await?;
    }

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut session, &mut inbound, &mut outbound, &mut stdin, &mut input).await?;
    shutdown_connection(&mut outbound).await;

    Ok(())
}

struct Session {
    nickname: String,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
enum NicknameError {
    #[error("nickname cannot be empty")]
    Empty,
    #[error("nickname cannot contain '{DELIMITER}'")]
    Delimiter,
}

fn check_nickname(nickname: &str) -> Result<(), NicknameError> {
    if nickname.is_empty() {
        return Err(NicknameError::Empty);
    }
    // Peers would read everything after the first '@' as the message.
    if nickname.contains(DELIMITER) {
        return Err(NicknameError::Delimiter);
    }
    Ok(())
}

impl Session {
    fn new(nickname: &str) -> Result<Self, NicknameError> {
        let nickname = nickname.trim();
        check_nickname(nickname)?;
        Ok(Self {
            nickname: nickname.to_string(),
        })
    }

    /// Adopts `new` and returns the rename to announce, or `None` when the
    /// name is unchanged.
    fn rename(&mut self, new: &str) -> Result<Option<Message>, NicknameError> {
        let new = new.trim();
        check_nickname(new)?;
        if new == self.nickname {
            return Ok(None);
        }
        let old = std::mem::replace(&mut self.nickname, new.to_string());
        Ok(Some(Message::Rename {
            old,
            new: new.to_string(),
        }))
    }

    async fn load_avatar(&self, path: &Path) -> Result<Message> {
        let image = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read avatar {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().replace(DELIMITER, "_"))
            .unwrap_or_else(|| "avatar".to_string());
        Ok(Message::avatar(self.nickname.clone(), filename, &image))
    }
}

async fn establish_connection(args: &ClientArgs) -> Result<(Inbound, Outbound)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);
    write_stdout(&format!("*** connected to {}", args.server)).await?;

    let (reader, writer) = stream.into_split();
    Ok((
        FramedRead::new(reader, LineCodec::new()),
        FramedWrite::new(writer, LineCodec::new()),
    ))
}

async fn run_client_loop(
    session: &mut Session,
    inbound: &mut Inbound,
    outbound: &mut Outbound,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_line = inbound.next() => {
                if !handle_server_line(server_line).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(session, bytes_read, input, outbound).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line(line: Option<Result<String, CodecError>>) -> Result<bool> {
    let Some(line) = line else {
        write_stdout("*** server closed the connection").await?;
        return Ok(false);
    };

    match Message::parse(&line?) {
        Ok(Some(message)) => render_message(message).await?,
        Ok(None) => {}
        Err(err) => debug!(error = %err, "ignoring malformed line from server"),
    }
    Ok(true)
}

async fn handle_stdin_input(
    session: &mut Session,
    bytes_read: io::Result<usize>,
    input: &str,
    outbound: &mut Outbound,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if let Some(new) = text.strip_prefix("/nick ") {
        match session.rename(new) {
            Ok(Some(rename)) => outbound.send(rename).await?,
            Ok(None) => {}
            Err(err) => write_stderr(&format!("!!! {err}")).await?,
        }
        return Ok(true);
    }

    if let Some(path) = text.strip_prefix("/avatar ") {
        match session.load_avatar(Path::new(path.trim())).await {
            Ok(avatar) => outbound.send(avatar).await?,
            Err(err) => write_stderr(&format!("!!! {err:#}")).await?,
        }
        return Ok(true);
    }

    outbound
        .send(Message::Text {
            author: session.nickname.clone(),
            body: text.to_string(),
        })
        .await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(outbound: &mut Outbound) {
    if let Err(error) = outbound.get_mut().shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn render_message(message: Message) -> io::Result<()> {
    match message {
        Message::Text { author, body } if author == SYSTEM_AUTHOR => {
            write_stdout(&format!("*** {body}")).await
        }
        Message::Text { author, body } => write_stdout(&format!("<{author}> {body}")).await,
        Message::Avatar {
            author,
            filename,
            data,
        } => {
            let size = decode_avatar(&data).map(|image| image.len()).unwrap_or(0);
            write_stdout(&format!("*** {author} set avatar {filename} ({size} bytes)")).await
        }
        Message::Rename { old, new } => {
            write_stdout(&format!("*** {old} is now known as {new}")).await
        }
        Message::Opaque(line) => write_stdout(&line).await,
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nicknames_cannot_carry_the_delimiter() {
        assert_eq!(Session::new("a@b").err(), Some(NicknameError::Delimiter));
        assert_eq!(Session::new("  ").err(), Some(NicknameError::Empty));
        assert_eq!(
            Session::new(" alice ").map(|session| session.nickname).ok(),
            Some("alice".to_string())
        );
    }

    #[test]
    fn rename_announces_only_real_changes() {
        let mut session = Session::new("alice").expect("valid nickname");

        assert_eq!(session.rename("alice"), Ok(None));
        assert_eq!(session.rename("ali@ce"), Err(NicknameError::Delimiter));
        assert_eq!(session.nickname, "alice");

        assert_eq!(
            session.rename("alicia"),
            Ok(Some(Message::Rename {
                old: "alice".into(),
                new: "alicia".into(),
            }))
        );
        assert_eq!(session.nickname, "alicia");
    }
}
