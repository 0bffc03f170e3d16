// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Decoding of the GPA range lists carried by GPA-direct packets.

use crate::PAGE_SIZE;
use serde::Deserialize;
use serde::Serialize;
use smallvec::SmallVec;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The descriptor header of a GPA-direct packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GpaDirectHeader {
    pub reserved: u32,
    pub range_count: u32,
}

/// A range header, followed by the page numbers it spans.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GpaRange {
    pub len: u32,
    pub offset: u32,
}

/// One physically contiguous piece of a guest buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SgEntry {
    pub gpa: u64,
    pub len: u64,
}

pub type ScatterGatherList = SmallVec<[SgEntry; 4]>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("empty range")]
    EmptyRange,
    #[error("empty byte count")]
    EmptyByteCount,
    #[error("range too small")]
    RangeTooSmall,
    #[error("byte offset too large")]
    OffsetTooLarge,
    #[error("integer overflow")]
    Overflow,
}

/// Parses the descriptor of a GPA-direct packet into a scatter-gather list.
///
/// Adjacent fragments that are physically contiguous, including fragments
/// from different ranges, are merged into one entry.
pub fn parse_gpa_direct(desc: &[u8]) -> Result<ScatterGatherList, Error> {
    let (header, mut rest) =
        GpaDirectHeader::read_from_prefix(desc).map_err(|_| Error::RangeTooSmall)?;
    if header.range_count == 0 {
        return Err(Error::EmptyRange);
    }
    let mut sgl = ScatterGatherList::new();
    for _ in 0..header.range_count {
        rest = parse_range(rest, &mut sgl)?;
    }
    Ok(sgl)
}

fn parse_range<'a>(buf: &'a [u8], sgl: &mut ScatterGatherList) -> Result<&'a [u8], Error> {
    let (range, mut rest) = GpaRange::read_from_prefix(buf).map_err(|_| Error::RangeTooSmall)?;
    if range.len == 0 {
        return Err(Error::EmptyByteCount);
    }
    if range.offset as usize >= PAGE_SIZE {
        return Err(Error::OffsetTooLarge);
    }

    let mut offset = range.offset as u64;
    let mut remaining = range.len as u64;
    while remaining != 0 {
        let (gpn, next) = u64::read_from_prefix(rest).map_err(|_| Error::RangeTooSmall)?;
        rest = next;
        let gpa = gpn
            .checked_mul(PAGE_SIZE as u64)
            .and_then(|base| base.checked_add(offset))
            .ok_or(Error::Overflow)?;
        let len = remaining.min(PAGE_SIZE as u64 - offset);
        match sgl.last_mut() {
            Some(last) if last.gpa.checked_add(last.len) == Some(gpa) => last.len += len,
            _ => sgl.push(SgEntry { gpa, len }),
        }
        remaining -= len;
        offset = 0;
    }
    Ok(rest)
}
