//! Length-Prefixed Frames
//!
//! Gives message boundaries to the byte-stream pipes between orchestrator and worker.
//!
//! ```text
//! +----------------+------------------+
//! | length (4 LE)  | rkyv payload     |
//! +----------------+------------------+
//! ```

use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::io::{BufReader, BufWriter, Read, Write};
use thiserror::Error;

/// Largest accepted payload (16 MB). Larger user contexts are split into
/// `Context` pieces by the sender.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur while encoding or decoding frames
#[derive(Debug, Error)]
pub enum FrameError {
    /// Underlying pipe failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message could not be serialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Payload failed validation
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Length prefix exceeds [`MAX_FRAME_SIZE`]
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge {
        /// Announced payload size
        size: usize,
        /// Accepted maximum
        max: usize,
    },

    /// Frame is structurally invalid
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Peer closed the stream on a frame boundary
    #[error("end of stream")]
    EndOfStream,
}

/// Serialize `message` and write it as one frame, flushing afterwards.
pub fn write_frame<W, T>(writer: &mut BufWriter<W>, message: &T) -> Result<(), FrameError>
where
    W: Write,
    T: Serialize<AllocSerializer<256>>,
{
    let bytes =
        rkyv::to_bytes::<_, 256>(message).map_err(|e| FrameError::Serialization(e.to_string()))?;

    let len = bytes.len();
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let prefix = u32::try_from(len).map_err(|e| FrameError::Serialization(e.to_string()))?;

    writer.write_all(&prefix.to_le_bytes())?;
    writer.write_all(&bytes)?;
    // The peer blocks on this frame; never leave it sitting in the buffer.
    writer.flush()?;

    Ok(())
}

/// Read one frame and deserialize it into `T`.
pub fn read_frame<R, T>(reader: &mut BufReader<R>) -> Result<T, FrameError>
where
    R: Read,
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::EndOfStream);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    if len == 0 {
        return Err(FrameError::InvalidFrame("zero-length frame".to_string()));
    }

    // rkyv needs an aligned buffer to validate in place
    let mut buf = rkyv::AlignedVec::with_capacity(len);
    buf.resize(len, 0);
    reader.read_exact(&mut buf)?;

    let archived = rkyv::check_archived_root::<T>(&buf)
        .map_err(|e| FrameError::Deserialization(e.to_string()))?;

    archived
        .deserialize(&mut Infallible)
        .map_err(|_| FrameError::Deserialization("infallible deserializer failed".to_string()))
}

/// Buffered frame writer
#[derive(Debug)]
pub struct FrameWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    /// Wrap a writer
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(8 * 1024, writer),
        }
    }

    /// Write one message
    pub fn write<T>(&mut self, message: &T) -> Result<(), FrameError>
    where
        T: Serialize<AllocSerializer<256>>,
    {
        write_frame(&mut self.writer, message)
    }
}

/// Buffered frame reader
#[derive(Debug)]
pub struct FrameReader<R: Read> {
    reader: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    /// Wrap a reader
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(8 * 1024, reader),
        }
    }

    /// Read one message
    pub fn read<T>(&mut self) -> Result<T, FrameError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
    {
        read_frame(&mut self.reader)
    }

    /// Whether a (possibly partial) frame is already buffered
    pub fn has_buffered_data(&self) -> bool {
        !self.reader.buffer().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OrchestratorCommand, Phase, WorkerMessage};
    use std::io::Cursor;

    #[test]
    fn test_command_sequence_keeps_boundaries() {
        let mut buffer = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buffer);
            writer
                .write(&OrchestratorCommand::Prerun { round: 3 })
                .unwrap();
            writer
                .write(&OrchestratorCommand::Round {
                    round: 3,
                    reclamation_active: false,
                })
                .unwrap();
            writer.write(&OrchestratorCommand::Shutdown).unwrap();
        }

        let mut reader = FrameReader::new(Cursor::new(buffer));
        assert!(matches!(
            reader.read::<OrchestratorCommand>().unwrap(),
            OrchestratorCommand::Prerun { round: 3 }
        ));
        assert!(matches!(
            reader.read::<OrchestratorCommand>().unwrap(),
            OrchestratorCommand::Round {
                round: 3,
                reclamation_active: false
            }
        ));
        assert!(matches!(
            reader.read::<OrchestratorCommand>().unwrap(),
            OrchestratorCommand::Shutdown
        ));
        assert!(matches!(
            reader.read::<OrchestratorCommand>(),
            Err(FrameError::EndOfStream)
        ));
    }

    #[test]
    fn test_failure_message_survives_transport() {
        let mut buffer = Vec::new();
        FrameWriter::new(&mut buffer)
            .write(&WorkerMessage::Failure {
                phase: Phase::Round(7),
                message: "boom".to_string(),
            })
            .unwrap();

        let decoded: WorkerMessage = FrameReader::new(Cursor::new(buffer)).read().unwrap();
        match decoded {
            WorkerMessage::Failure { phase, message } => {
                assert_eq!(phase, Phase::Round(7));
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_context_piece_fits_one_frame() {
        let chunk: Vec<u8> = (0..crate::CONTEXT_CHUNK_SIZE).map(|i| (i % 251) as u8).collect();
        let mut buffer = Vec::new();
        FrameWriter::new(&mut buffer)
            .write(&OrchestratorCommand::Context {
                chunk: chunk.clone(),
            })
            .unwrap();

        match FrameReader::new(Cursor::new(buffer)).read::<OrchestratorCommand>() {
            Ok(OrchestratorCommand::Context { chunk: decoded }) => assert_eq!(decoded, chunk),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_oversized_message_is_refused_by_writer() {
        let mut buffer = Vec::new();
        let result = FrameWriter::new(&mut buffer).write(&OrchestratorCommand::Context {
            chunk: vec![0; MAX_FRAME_SIZE + 1],
        });
        assert!(matches!(result, Err(FrameError::FrameTooLarge { .. })));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_rejects_oversized_length_prefix() {
        let mut bytes = u32::MAX.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 16]);
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let result: Result<WorkerMessage, _> = reader.read();
        assert!(matches!(result, Err(FrameError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_rejects_zero_length_frame() {
        let mut reader = FrameReader::new(Cursor::new(0u32.to_le_bytes().to_vec()));
        let result: Result<WorkerMessage, _> = reader.read();
        assert!(matches!(result, Err(FrameError::InvalidFrame(_))));
    }
}
