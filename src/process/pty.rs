// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Pseudo-terminal backed process.

use crate::process::{
    exit_code, lines::LineReader, InteractiveProcess, ProcessError, ProcessInput, Result,
};

use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, FdFlag},
    pty::openpty,
};
use std::{
    fs::File,
    io::{self, Read},
    os::fd::AsRawFd,
    process::{Child, Command, Stdio},
};
use tracing::debug;

/// Master side of a pseudo-terminal.
///
/// Once every slave descriptor is closed, reading the master fails with
/// `EIO` instead of returning zero. That is the end of the stream.
#[derive(Debug)]
struct PtyMaster(File);

impl Read for PtyMaster {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf) {
            Err(error) if error.raw_os_error() == Some(Errno::EIO as i32) => Ok(0),
            result => result,
        }
    }
}

/// Process attached to a pseudo-terminal.
#[derive(Debug)]
pub struct PtyProcess {
    child: Child,
    reader: LineReader<PtyMaster>,
    input: ProcessInput,
}

impl PtyProcess {
    /// Spawn command with its stdin, stdout, and stderr bound to a fresh
    /// pseudo-terminal slave.
    ///
    /// # Errors
    ///
    /// - Return [`ProcessError::Pty`] if pseudo-terminal could not be
    ///   allocated.
    /// - Return [`ProcessError::Spawn`] if command could not be started.
    pub fn spawn(mut command: Command) -> Result<Self> {
        let pty = openpty(None, None).map_err(ProcessError::Pty)?;

        // INVARIANT: Neither pty descriptor survives exec under its own number.
        //   - Child only gets the slave through its standard streams.
        close_on_exec(&pty.master)?;
        close_on_exec(&pty.slave)?;

        let stdin = pty.slave.try_clone().map_err(ProcessError::Spawn)?;
        let stdout = pty.slave.try_clone().map_err(ProcessError::Spawn)?;
        command
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(pty.slave));

        let child = command.spawn().map_err(ProcessError::Spawn);

        // INVARIANT: Parent must not hold any slave descriptor past spawn, or
        // the master never sees end of stream after child exits.
        drop(command);
        let child = child?;

        let master = File::from(pty.master);
        let writer = master.try_clone().map_err(ProcessError::Spawn)?;
        debug!("spawned pid {} under pty", child.id());

        Ok(Self {
            input: ProcessInput::new(writer, Some(child.id())),
            reader: LineReader::new(PtyMaster(master)),
            child,
        })
    }
}

fn close_on_exec(fd: &impl AsRawFd) -> Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(ProcessError::Pty)?;
    Ok(())
}

impl InteractiveProcess for PtyProcess {
    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.reader.read_line()?)
    }

    fn input(&self) -> ProcessInput {
        self.input.clone()
    }

    fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait();
        self.input.close();
        Ok(exit_code(status?))
    }
}
