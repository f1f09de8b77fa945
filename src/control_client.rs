use std::{io::Write, os::unix::net::UnixStream};

use anyhow::{Context, Result};
use byteorder::WriteBytesExt;

use crate::control_server::{socket_path, Command};

pub struct ControlClient {
    client: UnixStream,
}

impl ControlClient {
    pub fn new() -> Result<Self> {
        let path = socket_path();
        let client = UnixStream::connect(&path)
            .with_context(|| format!("is the daemon running? no socket at {}", path.display()))?;

        Ok(Self { client })
    }

    pub fn send(&mut self, command: Command) -> Result<()> {
        self.client.write_u8(command as u8)?;
        self.client.flush()?;
        Ok(())
    }
}
