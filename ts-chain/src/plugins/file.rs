use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::PathBuf;

use bytes::{BufMut, BytesMut};
use clap::{Arg, ArgAction, Command};

use crate::error::StageIoError;
use crate::packet::{PKT_SIZE, Packet, PacketSlot};
use crate::plugin::{InputPlugin, OutputPlugin, StageContext};

/// Reads 188-byte packets from a file. Packets without a sync byte are
/// passed on flagged as corrupted.
pub struct FileInput {
    path: PathBuf,
    reader: Option<BufReader<File>>,
}

impl FileInput {
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let matches = super::parse_args(
            Command::new("file").arg(Arg::new("path").required(true)),
            args,
        )?;
        let path = matches
            .get_one::<String>("path")
            .ok_or_else(|| anyhow::anyhow!("file: missing path"))?;
        Ok(Self {
            path: PathBuf::from(path),
            reader: None,
        })
    }
}

impl InputPlugin for FileInput {
    fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        let file = File::open(&self.path)
            .map_err(|e| anyhow::anyhow!("open {}: {}", self.path.display(), e))?;
        log::debug!("{}: reading {}", ctx, self.path.display());
        self.reader = Some(BufReader::new(file));
        Ok(())
    }

    fn receive(&mut self, batch: &mut [PacketSlot], ctx: &StageContext) -> Result<usize, StageIoError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| StageIoError::fatal(anyhow::anyhow!("file input not started")))?;

        let mut count = 0;
        for slot in batch.iter_mut() {
            let mut bytes = [0u8; PKT_SIZE];
            match read_packet(reader, &mut bytes)? {
                PKT_SIZE => {}
                0 => break,
                partial => {
                    log::warn!("{}: ignoring truncated packet of {} bytes", ctx, partial);
                    break;
                }
            }
            slot.packet = Packet::from_bytes(bytes);
            if !slot.packet.has_valid_sync() {
                slot.metadata.set_corrupted(true);
            }
            count += 1;
        }
        Ok(count)
    }

    fn stop(&mut self, _ctx: &StageContext) -> anyhow::Result<()> {
        self.reader = None;
        Ok(())
    }
}

/// Fills `buf` as far as the file allows; returns the number of bytes read.
fn read_packet(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Writes packets to a file, truncating it unless `--append` is given.
pub struct FileOutput {
    path: PathBuf,
    append: bool,
    file: Option<File>,
    buf: BytesMut,
}

impl FileOutput {
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let matches = super::parse_args(
            Command::new("file")
                .arg(Arg::new("path").required(true))
                .arg(
                    Arg::new("append")
                        .long("append")
                        .short('a')
                        .action(ArgAction::SetTrue),
                ),
            args,
        )?;
        let path = matches
            .get_one::<String>("path")
            .ok_or_else(|| anyhow::anyhow!("file: missing path"))?;
        Ok(Self {
            path: PathBuf::from(path),
            append: matches.get_flag("append"),
            file: None,
            buf: BytesMut::new(),
        })
    }
}

impl OutputPlugin for FileOutput {
    fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        let mut options = OpenOptions::new();
        options.create(true);
        if self.append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options
            .open(&self.path)
            .map_err(|e| anyhow::anyhow!("create {}: {}", self.path.display(), e))?;
        log::debug!("{}: writing {}", ctx, self.path.display());
        self.file = Some(file);
        Ok(())
    }

    fn send(&mut self, batch: &[PacketSlot], _ctx: &StageContext) -> Result<(), StageIoError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StageIoError::fatal(anyhow::anyhow!("file output not started")))?;
        self.buf.clear();
        self.buf.reserve(batch.len() * PKT_SIZE);
        for slot in batch {
            self.buf.put_slice(slot.packet.as_bytes());
        }
        file.write_all(&self.buf)?;
        Ok(())
    }

    fn stop(&mut self, _ctx: &StageContext) -> anyhow::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }
}
