use std::{
    env, fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{self, AtomicBool},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use byteorder::ReadBytesExt;
use crossbeam::channel::Sender;
use log::{debug, info, warn};
use mio::{net::UnixListener, Events, Interest, Poll, Token};

use crate::{event::Event, power::PowerSignal};

/// One byte commands accepted on the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    DisplayOff = 0,
    DisplayOn = 1,
    Retrigger = 2,
}

impl TryFrom<u8> for Command {
    type Error = anyhow::Error;

    fn try_from(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => Command::DisplayOff,
            1 => Command::DisplayOn,
            2 => Command::Retrigger,
            other => bail!("unknown control command {}", other),
        })
    }
}

impl From<Command> for Event {
    fn from(command: Command) -> Self {
        match command {
            Command::DisplayOff => Event::Power(PowerSignal::Display(false)),
            Command::DisplayOn => Event::Power(PowerSignal::Display(true)),
            Command::Retrigger => Event::Retrigger,
        }
    }
}

pub fn socket_path() -> PathBuf {
    Path::new(&env::temp_dir()).join("auto_backlight.sock")
}

pub struct ControlServer {
    poll: Poll,
    listener: UnixListener,
    sender: Sender<Event>,
}

impl ControlServer {
    pub fn new(sender: Sender<Event>) -> Result<Self> {
        Self::bind(&socket_path(), sender)
    }

    fn bind(socket_path: &Path, sender: Sender<Event>) -> Result<Self> {
        match fs::remove_file(socket_path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => (),
        }
        let mut listener = UnixListener::bind(socket_path)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, Token(0), Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            sender,
        })
    }

    pub fn run(mut self, exit_bool: Arc<AtomicBool>) -> JoinHandle<Result<()>> {
        thread::spawn(move || {
            let mut events = Events::with_capacity(1024);

            loop {
                if exit_bool.load(atomic::Ordering::Relaxed) {
                    info!("Control Server Shutting Down");
                    break;
                }

                match self.poll.poll(&mut events, Some(Duration::from_millis(100))) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    res => res?,
                }

                for event in &events {
                    debug!("Event: {:?}", event);
                    if event.token() == Token(0) && event.is_readable() {
                        self.accept_all()?;
                    }
                }
            }

            Ok(())
        })
    }

    /// Drains pending connections; the listener is edge triggered.
    fn accept_all(&mut self) -> Result<()> {
        loop {
            let (mut socket, _addr) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            let socket_read = read_command(&mut socket);
            drop(socket);

            match socket_read {
                Ok(byte) => {
                    debug!("Got Message: {}", byte);
                    match Command::try_from(byte) {
                        Ok(command) => self
                            .sender
                            .send(command.into())
                            .map_err(|_| anyhow!("dispatcher gone"))?,
                        Err(e) => warn!("{}", e),
                    }
                }
                Err(e) => warn!("Control client sent nothing: {}", e),
            }
        }
    }
}

/// The socket is non-blocking; give the client a moment to send its byte.
fn read_command(socket: &mut mio::net::UnixStream) -> io::Result<u8> {
    for _ in 0..50 {
        match socket.read_u8() {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10))
            }
            other => return other,
        }
    }
    Err(io::ErrorKind::TimedOut.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_map_to_events() {
        assert_eq!(
            Event::from(Command::try_from(0).unwrap()),
            Event::Power(PowerSignal::Display(false))
        );
        assert_eq!(
            Event::from(Command::try_from(1).unwrap()),
            Event::Power(PowerSignal::Display(true))
        );
        assert_eq!(Event::from(Command::try_from(2).unwrap()), Event::Retrigger);
        assert!(Command::try_from(9).is_err());
    }

    #[test]
    fn server_forwards_client_commands() {
        use std::io::Write;

        let path = env::temp_dir().join(format!("auto_backlight_test_{}.sock", std::process::id()));
        let (sender, receiver) = crossbeam::channel::unbounded();
        let server = ControlServer::bind(&path, sender).unwrap();
        let exit = Arc::new(AtomicBool::new(false));
        let handle = server.run(exit.clone());

        let mut client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        client.write_all(&[Command::Retrigger as u8]).unwrap();
        drop(client);

        assert_eq!(
            receiver.recv_timeout(Duration::from_secs(2)).unwrap(),
            Event::Retrigger
        );

        exit.store(true, atomic::Ordering::Relaxed);
        handle.join().unwrap().unwrap();
        fs::remove_file(&path).unwrap();
    }
}
