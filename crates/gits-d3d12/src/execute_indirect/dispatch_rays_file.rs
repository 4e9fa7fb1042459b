//! Text side-channel listing the `DispatchRays` arguments found in indirect argument buffers.
//!
//! One line per dispatch, whitespace separated decimal fields:
//!
//! ```text
//! command ray_gen_address ray_gen_size miss_address miss_size miss_stride hit_address hit_size
//! hit_stride callable_address callable_size callable_stride width height depth
//! ```
//!
//! Readers stop at the first line that does not parse.

use std::io::{self, BufRead, Write};

use crate::d3d12::{DispatchRaysDesc, GpuAddressRange, GpuAddressRangeAndStride};
use crate::key::CommandKey;

const FIELDS: usize = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchRaysRecord {
    pub command: CommandKey,
    pub desc: DispatchRaysDesc,
}

impl DispatchRaysRecord {
    pub fn write_line(&self, out: &mut impl Write) -> io::Result<()> {
        let d = &self.desc;
        let tables = [d.miss_shader_table, d.hit_group_table, d.callable_shader_table];
        write!(
            out,
            "{} {} {}",
            self.command,
            d.ray_generation_shader_record.start_address,
            d.ray_generation_shader_record.size_in_bytes
        )?;
        for table in tables {
            write!(
                out,
                " {} {} {}",
                table.start_address, table.size_in_bytes, table.stride_in_bytes
            )?;
        }
        writeln!(out, " {} {} {}", d.width, d.height, d.depth)
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        let values: Vec<u64> = line
            .split_whitespace()
            .map(|field| field.parse().ok())
            .collect::<Option<_>>()?;
        if values.len() != FIELDS {
            return None;
        }
        let table = |at: usize| GpuAddressRangeAndStride {
            start_address: values[at],
            size_in_bytes: values[at + 1],
            stride_in_bytes: values[at + 2],
        };
        Some(Self {
            command: CommandKey(values[0]),
            desc: DispatchRaysDesc {
                ray_generation_shader_record: GpuAddressRange {
                    start_address: values[1],
                    size_in_bytes: values[2],
                },
                miss_shader_table: table(3),
                hit_group_table: table(6),
                callable_shader_table: table(9),
                width: u32::try_from(values[12]).ok()?,
                height: u32::try_from(values[13]).ok()?,
                depth: u32::try_from(values[14]).ok()?,
            },
        })
    }
}

pub fn write_records(out: &mut impl Write, records: &[DispatchRaysRecord]) -> io::Result<()> {
    for record in records {
        record.write_line(out)?;
    }
    Ok(())
}

/// Read records until the first line that fails to read or parse.
pub fn read_records(input: impl BufRead) -> Vec<DispatchRaysRecord> {
    input
        .lines()
        .map_while(|line| line.ok().and_then(|line| DispatchRaysRecord::parse_line(&line)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(command: u64) -> DispatchRaysRecord {
        DispatchRaysRecord {
            command: CommandKey(command),
            desc: DispatchRaysDesc {
                ray_generation_shader_record: GpuAddressRange {
                    start_address: 0x1000,
                    size_in_bytes: 64,
                },
                hit_group_table: GpuAddressRangeAndStride {
                    start_address: 0x2000,
                    size_in_bytes: 128,
                    stride_in_bytes: 64,
                },
                width: 8,
                height: 4,
                depth: 1,
                ..Default::default()
            },
        }
    }

    #[test]
    fn lines_are_plain_decimal() {
        let mut out = Vec::new();
        record(12).write_line(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "12 4096 64 0 0 0 8192 128 64 0 0 0 8 4 1\n"
        );
    }

    #[test]
    fn reader_stops_at_first_malformed_line() {
        let mut out = Vec::new();
        write_records(&mut out, &[record(1), record(2)]).unwrap();
        out.extend_from_slice(b"3 not-a-number\n");
        record(4).write_line(&mut out).unwrap();

        let records = read_records(out.as_slice());
        assert_eq!(
            records.iter().map(|r| r.command.0).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(records[0], record(1));
    }
}
