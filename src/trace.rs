use std::{
    fs,
    io::{self, ErrorKind, Read},
    path::PathBuf,
    thread::{self, JoinHandle},
};

use crossbeam::channel::{Receiver, Sender};
use tracing::debug;
use xz2::read::XzDecoder;

// Instruction Format
const NUM_INSTR_DESTINATIONS: usize = 2;
const NUM_INSTR_SOURCES: usize = 4;
pub const INSTR_SIZE: usize = 64;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instr {
    pub ip: u64,

    pub is_branch: u8,
    pub branch_taken: u8,

    pub destination_registers: [u8; NUM_INSTR_DESTINATIONS],
    pub source_registers: [u8; NUM_INSTR_SOURCES],

    pub destination_memory: [u64; NUM_INSTR_DESTINATIONS],
    pub source_memory: [u64; NUM_INSTR_SOURCES],
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(word)
}

impl Instr {
    /// A record with a single store to `addr`.
    pub fn store(ip: u64, addr: u64) -> Self {
        Instr {
            ip,
            destination_memory: [addr, 0],
            ..Instr::default()
        }
    }

    pub fn from_bytes(bytes: &[u8; INSTR_SIZE]) -> Self {
        let mut instr = Instr {
            ip: le_u64(bytes, 0),
            is_branch: bytes[8],
            branch_taken: bytes[9],
            ..Instr::default()
        };
        instr.destination_registers.copy_from_slice(&bytes[10..12]);
        instr.source_registers.copy_from_slice(&bytes[12..16]);
        for (i, addr) in instr.destination_memory.iter_mut().enumerate() {
            *addr = le_u64(bytes, 16 + 8 * i);
        }
        for (i, addr) in instr.source_memory.iter_mut().enumerate() {
            *addr = le_u64(bytes, 32 + 8 * i);
        }
        instr
    }

    pub fn to_bytes(&self) -> [u8; INSTR_SIZE] {
        let mut bytes = [0u8; INSTR_SIZE];
        bytes[0..8].copy_from_slice(&self.ip.to_le_bytes());
        bytes[8] = self.is_branch;
        bytes[9] = self.branch_taken;
        bytes[10..12].copy_from_slice(&self.destination_registers);
        bytes[12..16].copy_from_slice(&self.source_registers);
        for (i, addr) in self.destination_memory.iter().enumerate() {
            bytes[16 + 8 * i..24 + 8 * i].copy_from_slice(&addr.to_le_bytes());
        }
        for (i, addr) in self.source_memory.iter().enumerate() {
            bytes[32 + 8 * i..40 + 8 * i].copy_from_slice(&addr.to_le_bytes());
        }
        bytes
    }

    /// Store addresses; these are what dirty cache lines.
    pub fn stores(&self) -> impl Iterator<Item = u64> + '_ {
        self.destination_memory
            .iter()
            .copied()
            .filter(|&addr| addr != 0)
    }
}

pub struct Trace {
    pub rec: Receiver<io::Result<Vec<Instr>>>,
    _thread: JoinHandle<()>,
}

impl Trace {
    /// Streams records from `path` on a reader thread. Files ending in `.xz`
    /// are decompressed.
    pub fn read(
        path: PathBuf,
        instr_per_block: usize,
        blocks_per_queue: usize,
    ) -> io::Result<Trace> {
        let file = fs::File::open(&path)?;
        let stream: Box<dyn Read + Send> = if path.extension().is_some_and(|ext| ext == "xz") {
            Box::new(XzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let (sender, receiver) = crossbeam::channel::bounded(blocks_per_queue);

        let t = thread::spawn(move || Trace::run_thread(stream, instr_per_block.max(1), sender));

        Ok(Trace {
            rec: receiver,
            _thread: t,
        })
    }

    fn run_thread(
        mut stream: Box<dyn Read + Send>,
        instr_per_block: usize,
        queue: Sender<io::Result<Vec<Instr>>>,
    ) {
        let mut bytes = vec![0u8; instr_per_block * INSTR_SIZE];
        let mut total = 0u64;
        loop {
            let filled = match fill(&mut stream, &mut bytes) {
                Ok(filled) => filled,
                Err(err) => {
                    let _ = queue.send(Err(err));
                    return;
                }
            };
            if filled == 0 {
                break;
            }
            let whole = filled - filled % INSTR_SIZE;
            let block = bytes[..whole]
                .chunks_exact(INSTR_SIZE)
                .map(|chunk| {
                    let mut record = [0u8; INSTR_SIZE];
                    record.copy_from_slice(chunk);
                    Instr::from_bytes(&record)
                })
                .collect::<Vec<_>>();
            total += block.len() as u64;

            if !block.is_empty() && queue.send(Ok(block)).is_err() {
                return;
            }
            if whole != filled {
                let _ = queue.send(Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "trace ends in a truncated record",
                )));
                return;
            }
        }
        debug!(records = total, "trace exhausted");
    }
}

/// Reads until `buf` is full or the stream ends.
fn fill(stream: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use xz2::write::XzEncoder;

    use super::*;

    fn sample(n: u64) -> Vec<Instr> {
        (0..n)
            .map(|i| Instr {
                ip: 0x400000 + 4 * i,
                source_registers: [1, 2, 0, 0],
                source_memory: [0x8000 + i, 0, 0, 0],
                destination_memory: [0x1000 * (i + 1), if i % 2 == 0 { 0x20 } else { 0 }],
                ..Instr::default()
            })
            .collect()
    }

    fn encode(instrs: &[Instr]) -> Vec<u8> {
        instrs.iter().flat_map(|i| i.to_bytes()).collect()
    }

    fn collect(trace: Trace) -> io::Result<Vec<Instr>> {
        let mut all = Vec::new();
        for block in trace.rec.iter() {
            all.extend(block?);
        }
        Ok(all)
    }

    #[test]
    fn stores_skip_empty_slots() {
        let instr = Instr {
            destination_memory: [0, 0x88],
            source_memory: [0x10, 0, 0, 0],
            ..Instr::default()
        };
        assert_eq!(instr.stores().collect::<Vec<_>>(), vec![0x88]);
        assert_eq!(Instr::store(1, 0x40).stores().collect::<Vec<_>>(), vec![0x40]);
    }

    #[test]
    fn record_layout_is_little_endian() {
        let instr = Instr {
            ip: 0x0102,
            is_branch: 1,
            destination_memory: [0xff, 0],
            ..Instr::default()
        };
        let bytes = instr.to_bytes();
        assert_eq!(&bytes[0..2], &[0x02, 0x01]);
        assert_eq!(bytes[8], 1);
        assert_eq!(bytes[16], 0xff);
        assert_eq!(Instr::from_bytes(&bytes), instr);
    }

    #[test]
    fn reads_raw_trace_in_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stores.trace");
        let instrs = sample(10);
        fs::write(&path, encode(&instrs)).unwrap();

        let trace = Trace::read(path, 4, 2).unwrap();
        let sizes = trace
            .rec
            .iter()
            .map(|b| b.unwrap().len())
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![4, 4, 2]);

        let path = dir.path().join("stores.trace");
        assert_eq!(collect(Trace::read(path, 3, 1).unwrap()).unwrap(), instrs);
    }

    #[test]
    fn reads_xz_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stores.trace.xz");
        let instrs = sample(100);
        let mut encoder = XzEncoder::new(fs::File::create(&path).unwrap(), 6);
        encoder.write_all(&encode(&instrs)).unwrap();
        encoder.finish().unwrap();

        assert_eq!(collect(Trace::read(path, 16, 4).unwrap()).unwrap(), instrs);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.trace");
        let mut bytes = encode(&sample(2));
        bytes.truncate(INSTR_SIZE + 10);
        fs::write(&path, bytes).unwrap();

        let blocks = Trace::read(path, 8, 2).unwrap().rec.iter().collect::<Vec<_>>();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].as_ref().unwrap().len(), 1);
        assert_eq!(
            blocks[1].as_ref().unwrap_err().kind(),
            ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Trace::read(dir.path().join("nope"), 8, 2).is_err());
    }
}
