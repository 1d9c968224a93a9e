//! Register map and decoding for the Janitza UMG 509 PRO

use serde::{Deserialize, Serialize};

/// Largest register count a single read-holding-registers request may ask for
pub const MAX_REGISTERS_PER_READ: u16 = 125;

/// Unused registers tolerated inside a single read block
const MAX_BLOCK_GAP: u16 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    #[default]
    Float32,
    Float64,
    Int16,
    Uint16,
    Int32,
    Uint32,
}

impl RegisterKind {
    pub fn word_count(self) -> u16 {
        match self {
            RegisterKind::Int16 | RegisterKind::Uint16 => 1,
            RegisterKind::Float32 | RegisterKind::Int32 | RegisterKind::Uint32 => 2,
            RegisterKind::Float64 => 4,
        }
    }

    /// Decode big-endian words (high word first)
    pub fn decode(self, words: &[u16]) -> Option<f64> {
        if words.len() < self.word_count() as usize {
            return None;
        }
        let value = match self {
            RegisterKind::Int16 => words[0] as i16 as f64,
            RegisterKind::Uint16 => words[0] as f64,
            RegisterKind::Int32 => join_u32(words) as i32 as f64,
            RegisterKind::Uint32 => join_u32(words) as f64,
            RegisterKind::Float32 => f32::from_bits(join_u32(words)) as f64,
            RegisterKind::Float64 => {
                let bits = ((words[0] as u64) << 48)
                    | ((words[1] as u64) << 32)
                    | ((words[2] as u64) << 16)
                    | words[3] as u64;
                f64::from_bits(bits)
            }
        };
        Some(value)
    }
}

fn join_u32(words: &[u16]) -> u32 {
    ((words[0] as u32) << 16) | words[1] as u32
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub name: String,
    pub address: u16,
    #[serde(default)]
    pub kind: RegisterKind,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

impl RegisterSpec {
    fn float(name: &str, address: u16, unit: &str) -> Self {
        Self {
            name: name.to_string(),
            address,
            kind: RegisterKind::Float32,
            unit: unit.to_string(),
            scale: 1.0,
        }
    }

    pub fn end(&self) -> u16 {
        self.address.saturating_add(self.kind.word_count())
    }
}

/// Float32 measurement map of the UMG 509 PRO, in dashboard order
pub fn default_registers() -> Vec<RegisterSpec> {
    vec![
        RegisterSpec::float("power_active_total", 19026, "W"),
        RegisterSpec::float("power_reactive_total", 19042, "var"),
        RegisterSpec::float("power_apparent_total", 19034, "VA"),
        RegisterSpec::float("energy_active_import", 19068, "Wh"),
        RegisterSpec::float("energy_active_export", 19076, "Wh"),
        RegisterSpec::float("energy_reactive_import", 19102, "varh"),
        RegisterSpec::float("energy_reactive_export", 19110, "varh"),
        RegisterSpec::float("voltage_l1", 19000, "V"),
        RegisterSpec::float("voltage_l2", 19002, "V"),
        RegisterSpec::float("voltage_l3", 19004, "V"),
        RegisterSpec::float("current_l1", 19012, "A"),
        RegisterSpec::float("current_l2", 19014, "A"),
        RegisterSpec::float("current_l3", 19016, "A"),
        RegisterSpec::float("frequency", 19050, "Hz"),
        RegisterSpec::float("power_factor", 19044, ""),
        RegisterSpec::float("thd_voltage_l1", 19112, "%"),
        RegisterSpec::float("thd_current_l1", 19118, "%"),
    ]
}

/// One read-holding-registers request and the registers it serves
#[derive(Debug, Clone, PartialEq)]
pub struct ReadBlock {
    pub start: u16,
    pub count: u16,
    /// Indices into the register list handed to `plan_reads`
    pub members: Vec<usize>,
}

impl ReadBlock {
    /// Slice the words for `spec` out of this block's response
    pub fn words_for<'a>(&self, spec: &RegisterSpec, words: &'a [u16]) -> Option<&'a [u16]> {
        let offset = spec.address.checked_sub(self.start)? as usize;
        words.get(offset..offset + spec.kind.word_count() as usize)
    }
}

/// Group registers into as few requests as possible.
///
/// Registers are visited by address; a register joins the current block when
/// the gap to it is at most `MAX_BLOCK_GAP` words and the block stays within
/// `MAX_REGISTERS_PER_READ` words.
pub fn plan_reads(registers: &[RegisterSpec]) -> Vec<ReadBlock> {
    let mut order: Vec<usize> = (0..registers.len()).collect();
    order.sort_by_key(|&i| registers[i].address);

    let mut blocks: Vec<ReadBlock> = Vec::new();
    for index in order {
        let spec = &registers[index];
        if let Some(block) = blocks.last_mut() {
            let block_end = block.start as u32 + block.count as u32;
            let new_end = block_end.max(spec.address as u32 + spec.kind.word_count() as u32);
            let fits_gap = spec.address as u32 <= block_end + MAX_BLOCK_GAP as u32;
            let fits_size = new_end - block.start as u32 <= MAX_REGISTERS_PER_READ as u32;
            if fits_gap && fits_size {
                block.count = (new_end - block.start as u32) as u16;
                block.members.push(index);
                continue;
            }
        }
        blocks.push(ReadBlock {
            start: spec.address,
            count: spec.kind.word_count(),
            members: vec![index],
        });
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_float32() {
        let bits = 230.5f32.to_bits();
        let words = [(bits >> 16) as u16, bits as u16];
        assert_eq!(RegisterKind::Float32.decode(&words), Some(230.5));
    }

    #[test]
    fn test_decode_signed_and_short_input() {
        assert_eq!(RegisterKind::Int16.decode(&[0xFFFE]), Some(-2.0));
        assert_eq!(RegisterKind::Int32.decode(&[0xFFFF, 0xFFFF]), Some(-1.0));
        assert_eq!(RegisterKind::Uint32.decode(&[0x0001, 0x0000]), Some(65536.0));
        assert_eq!(RegisterKind::Float32.decode(&[0x4366]), None);
    }

    #[test]
    fn test_decode_float64() {
        let bits = 1234.25f64.to_bits();
        let words = [
            (bits >> 48) as u16,
            (bits >> 32) as u16,
            (bits >> 16) as u16,
            bits as u16,
        ];
        assert_eq!(RegisterKind::Float64.decode(&words), Some(1234.25));
    }

    #[test]
    fn test_default_map_plans_into_few_blocks() {
        let registers = default_registers();
        let blocks = plan_reads(&registers);

        assert!(blocks.len() <= 2, "got {} blocks", blocks.len());
        let covered: usize = blocks.iter().map(|b| b.members.len()).sum();
        assert_eq!(covered, registers.len());
        for block in &blocks {
            assert!(block.count <= MAX_REGISTERS_PER_READ);
            for &member in &block.members {
                let spec = &registers[member];
                assert!(spec.address >= block.start);
                assert!(spec.end() <= block.start + block.count);
            }
        }
    }

    #[test]
    fn test_distant_registers_split() {
        let registers = vec![
            RegisterSpec::float("a", 100, ""),
            RegisterSpec::float("b", 3000, ""),
            RegisterSpec::float("c", 104, ""),
        ];
        let blocks = plan_reads(&registers);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].start, 100);
        assert_eq!(blocks[0].count, 6);
        assert_eq!(blocks[0].members, vec![0, 2]);
        assert_eq!(blocks[1].members, vec![1]);
    }

    #[test]
    fn test_words_for_offsets_into_block() {
        let spec = RegisterSpec::float("c", 104, "");
        let block = ReadBlock {
            start: 100,
            count: 6,
            members: vec![],
        };
        let words = [0, 1, 2, 3, 4, 5];
        assert_eq!(block.words_for(&spec, &words), Some(&words[4..6]));
    }
}
