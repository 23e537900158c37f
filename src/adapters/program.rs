//! Program image parsing.

use super::{ProgramFormat, ProgramMetadata};
use crate::error::{Result, SimError};
use object::{Object, ObjectSegment};

/// A contiguous chunk to place in target memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
    pub address: u64,
    pub data: Vec<u8>,
}

/// A parsed, loadable program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProgramImage {
    pub entry: u64,
    pub segments: Vec<Segment>,
}

/// Parse an uploaded image according to its declared format.
pub(crate) fn parse_image(data: &[u8], meta: &ProgramMetadata) -> Result<ProgramImage> {
    if data.is_empty() {
        return Err(SimError::InvalidArgument(format!(
            "program {} is empty",
            meta.name
        )));
    }
    match meta.format {
        ProgramFormat::Bin => parse_bin(data, meta),
        ProgramFormat::Elf => parse_elf(data, meta),
        ProgramFormat::Hex => Err(SimError::Unsupported(
            "Intel HEX images; convert to ELF or BIN".to_string(),
        )),
    }
}

fn parse_bin(data: &[u8], meta: &ProgramMetadata) -> Result<ProgramImage> {
    let load_addr = meta.load_addr.ok_or_else(|| {
        SimError::InvalidArgument(format!("BIN program {} needs a load_addr", meta.name))
    })?;
    Ok(ProgramImage {
        entry: meta.entry_point.unwrap_or(load_addr),
        segments: vec![Segment {
            address: load_addr,
            data: data.to_vec(),
        }],
    })
}

fn parse_elf(data: &[u8], meta: &ProgramMetadata) -> Result<ProgramImage> {
    let file = object::File::parse(data)
        .map_err(|e| SimError::InvalidArgument(format!("{}: not a valid ELF: {e}", meta.name)))?;

    let mut segments = Vec::new();
    for segment in file.segments() {
        let bytes = segment.data().map_err(|e| {
            SimError::InvalidArgument(format!("{}: unreadable segment: {e}", meta.name))
        })?;
        if bytes.is_empty() {
            continue;
        }
        segments.push(Segment {
            address: segment.address(),
            data: bytes.to_vec(),
        });
    }
    if segments.is_empty() {
        return Err(SimError::InvalidArgument(format!(
            "{}: ELF has no loadable segments",
            meta.name
        )));
    }

    Ok(ProgramImage {
        entry: meta.entry_point.unwrap_or_else(|| file.entry()),
        segments,
    })
}
