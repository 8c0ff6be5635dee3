//! wire protocol server
//!
//! one command loop over a byte stream, serving a local repository.
//! transport carriers (unix socket, ssh stdio, tcp) just hand the connected
//! stream to [`serve`].

use std::io::{Read, Write};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::repo::Repo;
use crate::stream::{is_truncation, ReadExt, WriteExt};

use super::{PROTOCOL_VERSION, STATUS_ERROR, STATUS_OK};

/// serve wire commands until the peer disconnects
pub fn serve<S: Read + Write>(repo: &mut Repo, stream: &mut S) -> Result<()> {
    loop {
        let command = match stream.read_pstr() {
            Ok(c) => c,
            Err(e) if is_truncation(&e) => {
                debug!("peer disconnected");
                return Ok(());
            }
            Err(e) => return Err(Error::Protocol(format!("unreadable command: {}", e))),
        };
        debug!(%command, "serving");

        match command.as_str() {
            "hello" => {
                ok(stream)?;
                stream
                    .write_pstr(PROTOCOL_VERSION)
                    .map_err(send_failed)?;
            }

            "get fsid" => {
                let uuid = repo.uuid().to_string();
                ok(stream)?;
                stream.write_pstr(&uuid).map_err(send_failed)?;
            }

            "get head" => match repo.head() {
                Ok(head) => {
                    ok(stream)?;
                    stream.write_hash(&head).map_err(send_failed)?;
                }
                Err(e) => fail(stream, &e.to_string())?,
            },

            "list commits" => match repo.list_commits() {
                Ok(commits) => {
                    ok(stream)?;
                    stream
                        .write_u32_le(commits.len() as u32)
                        .map_err(send_failed)?;
                    for commit in &commits {
                        stream.write_lbuf(&commit.to_bytes()).map_err(send_failed)?;
                    }
                }
                Err(e) => fail(stream, &e.to_string())?,
            },

            "list objs" => {
                let infos = repo.list_objects();
                ok(stream)?;
                stream
                    .write_u64_le(infos.len() as u64)
                    .map_err(send_failed)?;
                for info in &infos {
                    info.write_to(stream).map_err(send_failed)?;
                }
            }

            "getobjinfo" => {
                let hash = stream
                    .read_hash()
                    .map_err(|e| Error::Protocol(format!("short request: {}", e)))?;
                match repo.get_object_info(&hash) {
                    Some(info) => {
                        ok(stream)?;
                        info.write_to(stream).map_err(send_failed)?;
                    }
                    None => fail(stream, &format!("object not found: {}", hash))?,
                }
            }

            "readobjs" => {
                let count = stream
                    .read_u32_le()
                    .map_err(|e| Error::Protocol(format!("short request: {}", e)))?;
                let mut hashes = Vec::with_capacity(count.min(1 << 20) as usize);
                for _ in 0..count {
                    hashes.push(
                        stream
                            .read_hash()
                            .map_err(|e| Error::Protocol(format!("short request: {}", e)))?,
                    );
                }

                // validate up front so a failure never leaves a half stream
                if let Some(missing) = hashes.iter().find(|h| !repo.is_object_stored(h)) {
                    fail(stream, &format!("object not found: {}", missing))?;
                } else {
                    ok(stream)?;
                    repo.transmit(stream, &hashes)?;
                }
            }

            other => {
                warn!(command = other, "unknown wire command");
                fail(stream, &format!("unknown command: {}", other))?;
            }
        }

        stream.flush().map_err(send_failed)?;
    }
}

fn ok<W: Write>(w: &mut W) -> Result<()> {
    w.write_u8_val(STATUS_OK).map_err(send_failed)
}

fn fail<W: Write>(w: &mut W, message: &str) -> Result<()> {
    warn!(%message, "wire command failed");
    w.write_u8_val(STATUS_ERROR).map_err(send_failed)?;
    // error strings must fit a pstr
    let mut message = message.to_string();
    message.truncate(255);
    w.write_pstr(&message).map_err(send_failed)
}

fn send_failed(e: std::io::Error) -> Error {
    Error::Protocol(format!("send failed: {}", e))
}
