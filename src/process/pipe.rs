// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Pipe backed process.

use crate::process::{
    exit_code, lines::LineReader, InteractiveProcess, ProcessError, ProcessInput, Result,
};

use os_pipe::PipeReader;
use std::process::{Child, Command, Stdio};
use tracing::debug;

/// Process with stdout and stderr merged into one pipe.
#[derive(Debug)]
pub struct PipeProcess {
    child: Child,
    reader: LineReader<PipeReader>,
    input: ProcessInput,
}

impl PipeProcess {
    /// Spawn command with piped stdin, and stdout plus stderr merged into a
    /// single pipe.
    ///
    /// # Errors
    ///
    /// - Return [`ProcessError::Spawn`] if pipe could not be created, or
    ///   command could not be started.
    pub fn spawn(mut command: Command) -> Result<Self> {
        let (reader, writer) = os_pipe::pipe().map_err(ProcessError::Spawn)?;
        let stdout = writer.try_clone().map_err(ProcessError::Spawn)?;
        command
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(writer);

        let child = command.spawn().map_err(ProcessError::Spawn);

        // INVARIANT: Parent must not hold write end of pipe past spawn, or
        // reader never sees end of stream.
        drop(command);
        let mut child = child?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProcessError::Spawn(std::io::Error::other("stdin not captured")))?;
        debug!("spawned pid {} with pipes", child.id());

        Ok(Self {
            input: ProcessInput::new(stdin, Some(child.id())),
            reader: LineReader::new(reader),
            child,
        })
    }
}

impl InteractiveProcess for PipeProcess {
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
