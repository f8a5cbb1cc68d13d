use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

/// One half of an in-memory duplex connection.
///
/// Bytes written to one half are readable from the other. Reads block until
/// data arrives and return EOF once every clone of the peer half is dropped.
/// Cloning shares the underlying connection, which is how callers obtain
/// separate reader and writer handles onto the same half.
pub struct MemoryStream {
    tx: Sender<Vec<u8>>,
    rx: Arc<Mutex<ReadSide>>,
}

struct ReadSide {
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

/// Create a connected pair of in-memory duplex streams.
pub fn duplex_pair() -> (MemoryStream, MemoryStream) {
    let (a_tx, b_rx) = channel();
    let (b_tx, a_rx) = channel();
    (
        MemoryStream {
            tx: a_tx,
            rx: Arc::new(Mutex::new(ReadSide {
                rx: a_rx,
                pending: VecDeque::new(),
            })),
        },
        MemoryStream {
            tx: b_tx,
            rx: Arc::new(Mutex::new(ReadSide {
                rx: b_rx,
                pending: VecDeque::new(),
            })),
        },
    )
}

impl Clone for MemoryStream {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
        }
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut side = self.rx.lock().expect("memory stream lock poisoned");

        if side.pending.is_empty() {
            match side.rx.recv() {
                Ok(chunk) => side.pending.extend(chunk),
                // All senders on the peer half are gone: clean EOF.
                Err(_) => return Ok(0),
            }
        }

        let n = buf.len().min(side.pending.len());
        for slot in buf.iter_mut().take(n) {
            *slot = side.pending.pop_front().expect("pending byte counted");
        }
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx.send(buf.to_vec()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer half dropped")
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStream").finish_non_exhaustive()
    }
}
