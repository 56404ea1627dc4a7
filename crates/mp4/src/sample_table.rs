//! Progressive-file sample tables.
//!
//! - stts: decode durations
//! - ctts: composition offsets
//! - stss: sync samples (absent = every sample is sync)
//! - stsz: sample sizes
//! - stsc: sample-to-chunk runs
//! - stco/co64: chunk offsets

use crate::{ByteReader, Result};

/// A resolved sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub offset: u64,
    pub size: u32,
    /// Decode time in media timescale units
    pub dts: u64,
    pub duration: u32,
    pub cts_offset: i32,
    pub is_sync: bool,
}

impl Sample {
    pub fn pts(&self) -> i64 {
        self.dts as i64 + self.cts_offset as i64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleTable {
    pub samples: Vec<Sample>,
}

impl SampleTable {
    pub fn builder() -> SampleTableBuilder {
        SampleTableBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Index of the last sync sample whose decode time is at or before `dts`.
    pub fn sync_sample_before(&self, dts: u64) -> Option<usize> {
        let end = self.samples.partition_point(|s| s.dts <= dts);
        self.samples[..end].iter().rposition(|s| s.is_sync)
    }
}

/// Collects raw table boxes and resolves them into [`Sample`]s.
#[derive(Debug, Clone, Default)]
pub struct SampleTableBuilder {
    stts: Vec<(u32, u32)>,
    ctts: Vec<(u32, i32)>,
    sync_samples: Option<Vec<u32>>,
    uniform_size: u32,
    sizes: Vec<u32>,
    size_count: u32,
    stsc: Vec<(u32, u32)>,
    chunk_offsets: Vec<u64>,
}

impl SampleTableBuilder {
    /// Feeds one child box of `stbl`; unknown boxes are ignored.
    pub fn add_box(&mut self, box_type: &[u8; 4], payload: &[u8]) -> Result<()> {
        let mut r = ByteReader::new(payload);
        let (version, _) = r.full_box_header()?;
        match box_type {
            b"stts" => {
                let count = r.u32()?;
                for _ in 0..count {
                    self.stts.push((r.u32()?, r.u32()?));
                }
            }
            b"ctts" => {
                let count = r.u32()?;
                for _ in 0..count {
                    let n = r.u32()?;
                    let offset = if version == 0 { r.u32()? as i32 } else { r.i32()? };
                    self.ctts.push((n, offset));
                }
            }
            b"stss" => {
                let count = r.u32()?;
                let mut sync = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    sync.push(r.u32()?);
                }
                self.sync_samples = Some(sync);
            }
            b"stsz" => {
                self.uniform_size = r.u32()?;
                self.size_count = r.u32()?;
                if self.uniform_size == 0 {
                    for _ in 0..self.size_count {
                        self.sizes.push(r.u32()?);
                    }
                }
            }
            b"stsc" => {
                let count = r.u32()?;
                for _ in 0..count {
                    let first_chunk = r.u32()?;
                    let per_chunk = r.u32()?;
                    r.skip(4)?;
                    self.stsc.push((first_chunk, per_chunk));
                }
            }
            b"stco" => {
                let count = r.u32()?;
                for _ in 0..count {
                    self.chunk_offsets.push(r.u32()? as u64);
                }
            }
            b"co64" => {
                let count = r.u32()?;
                for _ in 0..count {
                    self.chunk_offsets.push(r.u64()?);
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn build(self) -> SampleTable {
        let count = self.size_count as usize;
        if count == 0 || self.chunk_offsets.is_empty() {
            return SampleTable::default();
        }

        let offsets = self.resolve_offsets(count);
        let mut durations = self
            .stts
            .iter()
            .flat_map(|&(n, delta)| std::iter::repeat_n(delta, n as usize));
        let mut cts = self
            .ctts
            .iter()
            .flat_map(|&(n, offset)| std::iter::repeat_n(offset, n as usize));

        let mut samples = Vec::with_capacity(count);
        let mut dts = 0u64;
        for (i, offset) in offsets.into_iter().enumerate() {
            let duration = durations.next().unwrap_or(0);
            let size = if self.uniform_size > 0 {
                self.uniform_size
            } else {
                self.sizes.get(i).copied().unwrap_or(0)
            };
            let is_sync = match &self.sync_samples {
                Some(sync) => sync.binary_search(&(i as u32 + 1)).is_ok(),
                None => true,
            };
            samples.push(Sample {
                offset,
                size,
                dts,
                duration,
                cts_offset: cts.next().unwrap_or(0),
                is_sync,
            });
            dts += duration as u64;
        }
        SampleTable { samples }
    }

    fn resolve_offsets(&self, count: usize) -> Vec<u64> {
        let mut offsets = Vec::with_capacity(count);
        let chunk_count = self.chunk_offsets.len();
        let mut sample = 0usize;
        for (run, &(first_chunk, per_chunk)) in self.stsc.iter().enumerate() {
            let last_chunk = self
                .stsc
                .get(run + 1)
                .map(|&(next, _)| next.saturating_sub(1) as usize)
                .unwrap_or(chunk_count);
            for chunk in first_chunk as usize..=last_chunk {
                let Some(&chunk_offset) = self.chunk_offsets.get(chunk.wrapping_sub(1)) else {
                    break;
                };
                let mut offset = chunk_offset;
                for _ in 0..per_chunk {
                    if sample >= count {
                        return offsets;
                    }
                    offsets.push(offset);
                    let size = if self.uniform_size > 0 {
                        self.uniform_size
                    } else {
                        self.sizes.get(sample).copied().unwrap_or(0)
                    };
                    offset += size as u64;
                    sample += 1;
                }
            }
        }
        offsets
    }
}
