//! wire protocol client
//!
//! implements [`Remote`] over any bidirectional byte stream, so pull works
//! unchanged against a peer reached through a socket, a pipe, or an
//! ssh-spawned server process.

use std::io::{Read, Write};

use tracing::debug;

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::object::{Object, ObjectInfo, ObjectType};
use crate::remote::Remote;
use crate::stream::{ReadExt, WriteExt};
use crate::types::Commit;

use super::{copy_object_stream, read_object_stream, PROTOCOL_VERSION, STATUS_ERROR, STATUS_OK};

/// default distance for byte-stream peers; local repositories are 0
const WIRE_DISTANCE: u32 = 16;

pub struct WireClient<S: Read + Write + Send> {
    stream: S,
    distance: u32,
}

impl<S: Read + Write + Send> WireClient<S> {
    /// connect over a byte stream and perform the version handshake
    pub fn connect(stream: S) -> Result<Self> {
        let mut client = Self {
            stream,
            distance: WIRE_DISTANCE,
        };

        client.send_command("hello")?;
        client.read_status()?;
        let version = client
            .stream
            .read_pstr()
            .map_err(|e| Error::Protocol(format!("handshake failed: {}", e)))?;
        if version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "peer speaks {}, this build speaks {}",
                version, PROTOCOL_VERSION
            )));
        }
        debug!(%version, "connected to peer");
        Ok(client)
    }

    pub fn with_distance(mut self, distance: u32) -> Self {
        self.distance = distance;
        self
    }

    pub(crate) fn send_command(&mut self, name: &str) -> Result<()> {
        self.stream
            .write_pstr(name)
            .and_then(|_| self.stream.flush())
            .map_err(|e| Error::Protocol(format!("send failed: {}", e)))
    }

    /// read a status byte; an error status consumes and returns the message
    pub(crate) fn read_status(&mut self) -> Result<()> {
        let status = self
            .stream
            .read_u8()
            .map_err(|e| Error::Protocol(format!("peer hung up: {}", e)))?;
        match status {
            STATUS_OK => Ok(()),
            STATUS_ERROR => {
                let message = self
                    .stream
                    .read_pstr()
                    .unwrap_or_else(|_| "unreadable error".to_string());
                Err(Error::Protocol(message))
            }
            other => Err(Error::Protocol(format!("unknown status byte {}", other))),
        }
    }
}

impl<S: Read + Write + Send> Remote for WireClient<S> {
    fn get_uuid(&mut self) -> Result<String> {
        self.send_command("get fsid")?;
        self.read_status()?;
        self.stream
            .read_pstr()
            .map_err(|e| Error::Protocol(format!("short response: {}", e)))
    }

    fn get_head(&mut self) -> Result<Hash> {
        self.send_command("get head")?;
        self.read_status()?;
        self.stream
            .read_hash()
            .map_err(|e| Error::Protocol(format!("short response: {}", e)))
    }

    fn list_commits(&mut self) -> Result<Vec<Commit>> {
        self.send_command("list commits")?;
        self.read_status()?;
        let count = self
            .stream
            .read_u32_le()
            .map_err(|e| Error::Protocol(format!("short response: {}", e)))?;
        let mut commits = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let blob = self
                .stream
                .read_lbuf()
                .map_err(|e| Error::Protocol(format!("short response: {}", e)))?;
            commits.push(Commit::from_bytes(&blob)?);
        }
        Ok(commits)
    }

    fn list_objects(&mut self) -> Result<Vec<ObjectInfo>> {
        self.send_command("list objs")?;
        self.read_status()?;
        let count = self
            .stream
            .read_u64_le()
            .map_err(|e| Error::Protocol(format!("short response: {}", e)))?;
        let mut infos = Vec::with_capacity(count.min(1 << 20) as usize);
        for _ in 0..count {
            infos.push(ObjectInfo::read_from(&mut self.stream)?);
        }
        Ok(infos)
    }

    fn get_object_info(&mut self, hash: &Hash) -> Result<Option<ObjectInfo>> {
        self.send_command("getobjinfo")?;
        self.stream
            .write_hash(hash)
            .and_then(|_| self.stream.flush())
            .map_err(|e| Error::Protocol(format!("send failed: {}", e)))?;

        match self.read_status() {
            Ok(()) => Ok(Some(ObjectInfo::read_from(&mut self.stream)?)),
            Err(Error::Protocol(message)) if message.contains("not found") => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn get_object(&mut self, hash: &Hash) -> Result<Option<Object>> {
        match self.get_objects(std::slice::from_ref(hash)) {
            Ok(stream) => {
                let mut objects = read_object_stream(&mut stream.as_slice())?;
                Ok(objects.pop())
            }
            Err(Error::Protocol(message)) if message.contains("not found") => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn add_object(&mut self, _kind: ObjectType, hash: &Hash, _payload: &[u8]) -> Result<()> {
        Err(Error::Unsupported(format!(
            "wire transport is read-only, cannot store {}",
            hash
        )))
    }

    fn get_objects(&mut self, hashes: &[Hash]) -> Result<Vec<u8>> {
        self.send_command("readobjs")?;
        self.stream
            .write_u32_le(hashes.len() as u32)
            .map_err(|e| Error::Protocol(format!("send failed: {}", e)))?;
        for hash in hashes {
            self.stream
                .write_hash(hash)
                .map_err(|e| Error::Protocol(format!("send failed: {}", e)))?;
        }
        self.stream
            .flush()
            .map_err(|e| Error::Protocol(format!("send failed: {}", e)))?;

        self.read_status()?;
        let mut buf = Vec::new();
        copy_object_stream(&mut self.stream, &mut buf)?;
        Ok(buf)
    }

    fn distance(&self) -> u32 {
        self.distance
    }
}
