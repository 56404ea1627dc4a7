use crate::{Result, psi::parse_section};

/// Program Association Table (PAT) - Table ID 0x00
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pat {
    pub transport_stream_id: u16,
    pub version_number: u8,
    pub programs: Vec<PatProgram>,
}

/// Program entry in PAT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatProgram {
    /// Program number (0 = Network PID)
    pub program_number: u16,
    pub pmt_pid: u16,
}

impl Pat {
    pub const TABLE_ID: u8 = 0x00;

    pub fn parse(data: &[u8]) -> Result<Self> {
        let section = parse_section(data, Self::TABLE_ID)?;
        let programs = section
            .body
            .chunks_exact(4)
            .map(|entry| PatProgram {
                program_number: ((entry[0] as u16) << 8) | entry[1] as u16,
                pmt_pid: ((entry[2] as u16 & 0x1F) << 8) | entry[3] as u16,
            })
            .collect();

        Ok(Pat {
            transport_stream_id: section.table_id_extension,
            version_number: section.version_number,
            programs,
        })
    }

    /// PMT PID of the first real program; the network entry is skipped.
    pub fn first_program_pid(&self) -> Option<u16> {
        self.programs
            .iter()
            .find(|p| p.program_number != 0)
            .map(|p| p.pmt_pid)
    }

    /// Serializes the table body for [`crate::psi::build_section`].
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.programs.len() * 4);
        for program in &self.programs {
            body.extend_from_slice(&program.program_number.to_be_bytes());
            body.push(0xE0 | ((program.pmt_pid >> 8) as u8 & 0x1F));
            body.push(program.pmt_pid as u8);
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::build_section;

    #[test]
    fn test_pat_programs() {
        let pat = Pat {
            transport_stream_id: 1,
            version_number: 2,
            programs: vec![
                PatProgram {
                    program_number: 0,
                    pmt_pid: 0x10,
                },
                PatProgram {
                    program_number: 1,
                    pmt_pid: 0x1000,
                },
            ],
        };
        let data = build_section(Pat::TABLE_ID, 1, 2, &pat.body());
        let parsed = Pat::parse(&data).unwrap();
        assert_eq!(parsed, pat);
        assert_eq!(parsed.first_program_pid(), Some(0x1000));
    }

    #[test]
    fn test_pat_too_short() {
        assert!(Pat::parse(&[0x00, 0xB0]).is_err());
    }
}
