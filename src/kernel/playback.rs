//! Warehouse capture files and the in-memory playback driver.
//!
//! A capture file is a stream of length-prefixed records (packets,
//! conntrack events, netlogger events) in network byte order. The playback
//! driver replays one through a live engine, recording the verdicts and the
//! ids that will need cleanup.

use super::{
    conntrack_event_allowed, ConntrackEvent, ConntrackEventType, KernelDriver, NetloggerEvent,
    PlaybackCleanup, Verdict,
};
use crate::dispatch::DispatchEngine;
use crate::{Error, Result};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Capture file magic
const MAGIC: [u8; 4] = *b"NFW1";

const RECORD_PACKET: u8 = 1;
const RECORD_CONNTRACK: u8 = 2;
const RECORD_NETLOGGER: u8 = 3;

/// One replayable record.
#[derive(Debug, Clone)]
pub enum Record {
    Packet { ctid: u32, mark: u32, data: Vec<u8> },
    Conntrack(ConntrackEvent),
    Netlogger(NetloggerEvent),
}

/// Writes capture files.
pub struct CaptureWriter<W: Write> {
    out: W,
}

impl<W: Write> CaptureWriter<W> {
    pub fn new(mut out: W) -> Result<Self> {
        out.write_all(&MAGIC)?;
        Ok(Self { out })
    }

    pub fn write_packet(&mut self, ctid: u32, mark: u32, data: &[u8]) -> Result<()> {
        self.out.write_all(&[RECORD_PACKET])?;
        self.out.write_all(&ctid.to_be_bytes())?;
        self.out.write_all(&mark.to_be_bytes())?;
        self.out.write_all(&(data.len() as u32).to_be_bytes())?;
        self.out.write_all(data)?;
        Ok(())
    }

    pub fn write_conntrack(&mut self, event: &ConntrackEvent) -> Result<()> {
        self.out.write_all(&[RECORD_CONNTRACK])?;
        self.out.write_all(&[event.event_type.to_u8()])?;
        self.out.write_all(&event.conntrack_id.to_be_bytes())?;
        self.out.write_all(&[event.protocol])?;
        write_addr(&mut self.out, &event.src_address)?;
        write_addr(&mut self.out, &event.dst_address)?;
        self.out.write_all(&event.src_port.to_be_bytes())?;
        self.out.write_all(&event.dst_port.to_be_bytes())?;
        self.out.write_all(&event.orig_bytes.to_be_bytes())?;
        self.out.write_all(&event.repl_bytes.to_be_bytes())?;
        Ok(())
    }

    pub fn write_netlogger(&mut self, event: &NetloggerEvent) -> Result<()> {
        self.out.write_all(&[RECORD_NETLOGGER])?;
        self.out.write_all(&[event.version, event.protocol])?;
        self.out.write_all(&event.icmp_type.to_be_bytes())?;
        self.out
            .write_all(&[event.src_interface, event.dst_interface])?;
        write_addr(&mut self.out, &event.src_address)?;
        write_addr(&mut self.out, &event.dst_address)?;
        self.out.write_all(&event.src_port.to_be_bytes())?;
        self.out.write_all(&event.dst_port.to_be_bytes())?;
        self.out.write_all(&event.mark.to_be_bytes())?;
        let prefix = event.prefix.as_bytes();
        self.out.write_all(&(prefix.len() as u16).to_be_bytes())?;
        self.out.write_all(prefix)?;
        Ok(())
    }
}

/// Reads capture files.
pub struct CaptureReader<R: Read> {
    input: R,
}

impl<R: Read> CaptureReader<R> {
    pub fn new(mut input: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(Error::Capture("bad capture file magic".into()));
        }
        Ok(Self { input })
    }

    /// Next record, or None at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        let mut kind = [0u8; 1];
        match self.input.read_exact(&mut kind) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        match kind[0] {
            RECORD_PACKET => {
                let ctid = read_u32(&mut self.input)?;
                let mark = read_u32(&mut self.input)?;
                let len = read_u32(&mut self.input)? as usize;
                let mut data = vec![0u8; len];
                self.input.read_exact(&mut data)?;
                Ok(Some(Record::Packet { ctid, mark, data }))
            }
            RECORD_CONNTRACK => {
                let event_type = ConntrackEventType::from_u8(read_u8(&mut self.input)?)
                    .ok_or_else(|| Error::Capture("unknown conntrack event type".into()))?;
                let conntrack_id = read_u32(&mut self.input)?;
                let protocol = read_u8(&mut self.input)?;
                let src_address = read_addr(&mut self.input)?;
                let dst_address = read_addr(&mut self.input)?;
                let src_port = read_u16(&mut self.input)?;
                let dst_port = read_u16(&mut self.input)?;
                let orig_bytes = read_u64(&mut self.input)?;
                let repl_bytes = read_u64(&mut self.input)?;
                Ok(Some(Record::Conntrack(ConntrackEvent {
                    event_type,
                    conntrack_id,
                    protocol,
                    src_address,
                    dst_address,
                    src_port,
                    dst_port,
                    orig_bytes,
                    repl_bytes,
                })))
            }
            RECORD_NETLOGGER => {
                let version = read_u8(&mut self.input)?;
                let protocol = read_u8(&mut self.input)?;
                let icmp_type = read_u16(&mut self.input)?;
                let src_interface = read_u8(&mut self.input)?;
                let dst_interface = read_u8(&mut self.input)?;
                let src_address = read_addr(&mut self.input)?;
                let dst_address = read_addr(&mut self.input)?;
                let src_port = read_u16(&mut self.input)?;
                let dst_port = read_u16(&mut self.input)?;
                let mark = read_u32(&mut self.input)?;
                let prefix_len = read_u16(&mut self.input)? as usize;
                let mut prefix = vec![0u8; prefix_len];
                self.input.read_exact(&mut prefix)?;
                let prefix = String::from_utf8(prefix)
                    .map_err(|_| Error::Capture("netlogger prefix is not UTF-8".into()))?;
                Ok(Some(Record::Netlogger(NetloggerEvent {
                    version,
                    protocol,
                    icmp_type,
                    src_interface,
                    dst_interface,
                    src_address,
                    dst_address,
                    src_port,
                    dst_port,
                    mark,
                    prefix,
                })))
            }
            other => Err(Error::Capture(format!("unknown record kind {}", other))),
        }
    }
}

fn write_addr<W: Write>(out: &mut W, addr: &IpAddr) -> Result<()> {
    match addr {
        IpAddr::V4(a) => {
            out.write_all(&[4])?;
            out.write_all(&a.octets())?;
        }
        IpAddr::V6(a) => {
            out.write_all(&[6])?;
            out.write_all(&a.octets())?;
        }
    }
    Ok(())
}

fn read_addr<R: Read>(input: &mut R) -> Result<IpAddr> {
    match read_u8(input)? {
        4 => {
            let mut octets = [0u8; 4];
            input.read_exact(&mut octets)?;
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 => {
            let mut octets = [0u8; 16];
            input.read_exact(&mut octets)?;
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => Err(Error::Capture(format!("unknown address family {}", other))),
    }
}

fn read_u8<R: Read>(input: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    input.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16<R: Read>(input: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    input.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32<R: Read>(input: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64<R: Read>(input: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// A verdict recorded during playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerdictRecord {
    pub conntrack_id: u32,
    pub verdict: Verdict,
    pub mark: u32,
}

/// In-memory kernel driver: replays capture files through the engine.
pub struct PlaybackDriver {
    engine: Arc<DispatchEngine>,
    verdicts: Mutex<Vec<VerdictRecord>>,
}

impl PlaybackDriver {
    pub fn new(engine: Arc<DispatchEngine>) -> Self {
        Self {
            engine,
            verdicts: Mutex::new(Vec::new()),
        }
    }

    /// Copy of the verdicts applied so far.
    pub fn verdicts(&self) -> Vec<VerdictRecord> {
        self.verdicts.lock().unwrap().clone()
    }
}

impl KernelDriver for PlaybackDriver {
    fn send_verdict(&self, ctid: u32, verdict: Verdict, mark: u32) {
        self.verdicts.lock().unwrap().push(VerdictRecord {
            conntrack_id: ctid,
            verdict,
            mark,
        });
    }

    async fn warehouse_playback_file(&self, path: &Path) -> Result<PlaybackCleanup> {
        let file = File::open(path)?;
        let mut reader = CaptureReader::new(BufReader::new(file))?;
        let mut cleanup = PlaybackCleanup::default();
        let mut records = 0usize;

        while let Some(record) = reader.next_record()? {
            records += 1;
            match record {
                Record::Packet { ctid, mark, data } => {
                    let length = data.len();
                    let (verdict, new_mark) =
                        self.engine.nfqueue_callback(ctid, &data, length, mark).await;
                    self.send_verdict(ctid, verdict, new_mark);
                    cleanup.nfqueue_ids.insert(ctid);
                }
                Record::Conntrack(event) => {
                    if conntrack_event_allowed(&event) {
                        cleanup.conntrack_ids.insert(event.conntrack_id);
                        self.engine.conntrack_callback(event);
                    }
                }
                Record::Netlogger(event) => {
                    self.engine.netlogger_callback(&event);
                }
            }
        }

        debug!("playback finished after {} records", records);
        Ok(cleanup)
    }

    fn engine(&self) -> &Arc<DispatchEngine> {
        &self.engine
    }
}
