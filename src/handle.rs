//! Public handle API and the open pipeline.
//!
//! A [`Handle`] owns one layer stack. `open` resolves a layer
//! specification against the registry, asks the last definition in the
//! chain that implements `open` to produce the OS resource (it recurses
//! through the definitions below it, bottom first), then pushes the
//! remaining definitions on top. Nothing is applied until the whole chain
//! resolved, so a bad spec never leaves a half-built handle behind.
//!
//! Vtable-level operations speak in sentinel returns and per-slot error
//! flags; this module is the boundary where those become `Result`s.

use std::io::SeekFrom;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::error::StreamError;
use crate::layer::stack::{HandleToken, LayerStack};
use crate::layer::{ChainLink, OpenTarget, F_ERROR};
use crate::registry;

/// One open stream: the stack of layers behind it, top layer first in
/// every operation.
pub struct Handle {
    stack: LayerStack,
}

impl Handle {
    /// Open `path` through the process default layer chain.
    pub fn open<P: AsRef<Path>>(path: P, mode: &str) -> Result<Handle, StreamError> {
        let chain = registry::default_chain()?;
        Self::openn(&chain, mode, &OpenTarget::Path(path.as_ref()))
    }

    /// Open `path` through an explicit layer specification, e.g.
    /// `"unix perlio crlf"`.
    pub fn open_with<P: AsRef<Path>>(
        spec: &str,
        path: P,
        mode: &str,
    ) -> Result<Handle, StreamError> {
        let chain = registry::resolve(spec)?;
        Self::openn(&chain, mode, &OpenTarget::Path(path.as_ref()))
    }

    /// Adopt an already-open descriptor under the default chain. The
    /// descriptor's refcount is taken over; closing the handle closes the
    /// descriptor once nothing else references it.
    pub fn from_fd(fd: RawFd, mode: &str) -> Result<Handle, StreamError> {
        let chain = registry::default_chain()?;
        Self::openn(&chain, mode, &OpenTarget::Fd(fd))
    }

    /// Standard input, shared with everything else using fd 0.
    pub fn stdin() -> Result<Handle, StreamError> {
        Self::from_fd(0, "r")
    }

    /// Standard output.
    pub fn stdout() -> Result<Handle, StreamError> {
        Self::from_fd(1, "w")
    }

    /// Standard error, unbuffered by convention is left to the caller.
    pub fn stderr() -> Result<Handle, StreamError> {
        Self::from_fd(2, "w")
    }

    fn openn(
        chain: &[ChainLink],
        mode: &str,
        target: &OpenTarget<'_>,
    ) -> Result<Handle, StreamError> {
        if crate::layer::unix::oflags_for_mode(mode) == -1 {
            return Err(StreamError::BadMode(mode.to_string()));
        }
        let opener = chain
            .iter()
            .rposition(|l| l.def.open.is_some())
            .ok_or_else(|| {
                let names: Vec<_> = chain.iter().map(|l| l.def.name).collect();
                StreamError::NoOpener(names.join(" "))
            })?;
        let open = chain[opener].def.open.expect("rposition found an open op");
        let mut stack = open(chain, opener, mode, target)
            .ok_or_else(|| StreamError::from_errno(0))?;
        // Definitions above the opener: pushed in spec order on top.
        for link in &chain[opener + 1..] {
            if stack.push(link.def, Some(mode), link.arg.as_deref()) != 0 {
                let err = StreamError::from_errno(0);
                stack.close();
                return Err(err);
            }
        }
        log::debug!("open: stack is {:?}", stack.layer_names());
        Ok(Handle { stack })
    }

    /// Error for a failed operation, preferring the errno saved on the
    /// flagged layer over whatever the thread's errno has become since.
    fn op_error(&self) -> StreamError {
        let mut i = self.stack.top_index();
        while let Some(j) = i {
            if self.stack.slot(j).flags & F_ERROR != 0 {
                return StreamError::from_errno(self.stack.saved_errno(j));
            }
            i = self.stack.next_below(j);
        }
        StreamError::from_errno(0)
    }

    fn top(&self) -> Result<usize, StreamError> {
        self.stack.top_index().ok_or(StreamError::InvalidHandle)
    }

    /// Read up to `buf.len()` bytes. Returns 0 at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let top = self.top()?;
        let n = self.stack.read_at(top, buf);
        if !self.stack.is_valid() {
            return Err(StreamError::Aborted);
        }
        if n < 0 {
            return Err(self.op_error());
        }
        if n == 0 && !buf.is_empty() && !self.stack.eof_at(top) && self.stack.error_at(top) {
            return Err(self.op_error());
        }
        Ok(n as usize)
    }

    /// Write the whole buffer through the stack. Partial progress before a
    /// hard error is reported as the count actually taken, with the error
    /// flag left set for [`Handle::error`].
    pub fn write(&mut self, data: &[u8]) -> Result<usize, StreamError> {
        let top = self.top()?;
        let n = self.stack.write_at(top, data);
        if !self.stack.is_valid() {
            return Err(StreamError::Aborted);
        }
        if n < 0 {
            return Err(self.op_error());
        }
        if n == 0 && !data.is_empty() {
            return Err(self.op_error());
        }
        Ok(n as usize)
    }

    /// Push bytes back into the stream so subsequent reads see them again,
    /// before any bytes not yet consumed.
    pub fn unread(&mut self, data: &[u8]) -> Result<usize, StreamError> {
        let top = self.top()?;
        let n = self.stack.unread_at(top, data);
        if n < 0 {
            return Err(self.op_error());
        }
        Ok(n as usize)
    }

    /// Drain buffered writes all the way to the OS.
    pub fn flush(&mut self) -> Result<(), StreamError> {
        let top = self.top()?;
        if self.stack.flush_at(top) != 0 {
            if !self.stack.is_valid() {
                return Err(StreamError::Aborted);
            }
            return Err(self.op_error());
        }
        Ok(())
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<(), StreamError> {
        let (offset, whence) = match pos {
            SeekFrom::Start(o) => (o as i64, libc::SEEK_SET),
            SeekFrom::Current(o) => (o, libc::SEEK_CUR),
            SeekFrom::End(o) => (o, libc::SEEK_END),
        };
        let top = self.top()?;
        if self.stack.seek_at(top, offset, whence) != 0 {
            return Err(self.op_error());
        }
        Ok(())
    }

    /// Logical position: the OS position adjusted for everything buffered
    /// above it. -1 means the position is unknown (non-seekable stream
    /// after a discarded buffer).
    pub fn tell(&mut self) -> Result<i64, StreamError> {
        let top = self.top()?;
        Ok(self.stack.tell_at(top))
    }

    /// Whether the last read hit end of stream.
    pub fn eof(&self) -> bool {
        match self.stack.top_index() {
            Some(top) => self.stack.eof_at(top),
            None => true,
        }
    }

    /// Whether an operation failed since the last [`Handle::clearerr`].
    pub fn error(&self) -> bool {
        match self.stack.top_index() {
            Some(top) => self.stack.error_at(top),
            None => true,
        }
    }

    pub fn clearerr(&mut self) {
        if let Some(top) = self.stack.top_index() {
            self.stack.clearerr_at(top);
        }
    }

    /// The descriptor at the bottom of the stack, or -1 if none.
    pub fn fileno(&self) -> RawFd {
        match self.stack.top_index() {
            Some(top) => self.stack.fileno_at(top),
            None => -1,
        }
    }

    /// Switch the handle to binary mode: every layer, top down, is asked
    /// to stop translating or remove itself.
    pub fn binmode(&mut self) -> Result<(), StreamError> {
        let mut i = Some(self.top()?);
        while let Some(j) = i {
            let below = self.stack.next_below(j);
            self.stack.binmode_at(j);
            i = below;
        }
        Ok(())
    }

    /// Push an extra chain of layers onto the open handle, e.g.
    /// `apply_layers("crlf", None)` to add text translation after the
    /// fact. Fails as a whole: a spec that does not parse applies nothing.
    pub fn apply_layers(&mut self, spec: &str, mode: Option<&str>) -> Result<(), StreamError> {
        let chain = registry::resolve(spec)?;
        self.top()?;
        for link in &chain {
            if self.stack.push(link.def, mode, link.arg.as_deref()) != 0 {
                return Err(StreamError::from_errno(0));
            }
        }
        Ok(())
    }

    /// Names of the live layers, top first.
    pub fn layer_names(&self) -> Vec<&'static str> {
        self.stack.layer_names()
    }

    /// Duplicate the handle. Without [`DUP_FD`](crate::layer::DUP_FD) in
    /// `flags` the two handles share one descriptor and one refcount
    /// entry, coupling their closes; with it the OS descriptor itself is
    /// duplicated.
    pub fn dup(&mut self, flags: u32) -> Result<Handle, StreamError> {
        self.top()?;
        let mut new = LayerStack::new();
        // Bottom-up so each layer lands on the one it sat on before.
        let mut order = Vec::new();
        let mut i = self.stack.top_index();
        while let Some(j) = i {
            order.push(j);
            i = self.stack.next_below(j);
        }
        for &j in order.iter().rev() {
            let dup = self
                .stack
                .slot(j)
                .def
                .and_then(|d| d.dup)
                .unwrap_or(crate::layer::base_dup);
            if dup(&mut new, &self.stack, j, flags) != 0 {
                new.close();
                return Err(StreamError::from_errno(0));
            }
        }
        Ok(Handle { stack: new })
    }

    /// Close the handle and pop every layer. Only the last handle
    /// referencing the underlying descriptor issues the OS close.
    pub fn close(&mut self) -> Result<(), StreamError> {
        if !self.stack.is_valid() {
            return Err(StreamError::InvalidHandle);
        }
        if self.stack.close() != 0 {
            return Err(self.op_error());
        }
        Ok(())
    }

    /// Token the async-check callback can hold to reach this handle.
    pub fn token(&self) -> HandleToken {
        self.stack.token()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.stack.is_valid() {
            let _ = self.stack.close();
        }
    }
}

impl std::io::Read for Handle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Handle::read(self, buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

impl std::io::Write for Handle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Handle::write(self, buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Handle::flush(self).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}
