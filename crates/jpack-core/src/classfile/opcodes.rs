use super::ClassFileError;

pub(super) const LDC: u8 = 0x12;
pub(super) const LDC_W: u8 = 0x13;
pub(super) const GETSTATIC: u8 = 0xb2;
pub(super) const PUTFIELD: u8 = 0xb5;
pub(super) const INVOKEVIRTUAL: u8 = 0xb6;
pub(super) const INVOKEINTERFACE: u8 = 0xb9;
pub(super) const NEW: u8 = 0xbb;
pub(super) const ANEWARRAY: u8 = 0xbd;
pub(super) const CHECKCAST: u8 = 0xc0;
pub(super) const INSTANCEOF: u8 = 0xc1;
pub(super) const MULTIANEWARRAY: u8 = 0xc5;

const TABLESWITCH: u8 = 0xaa;
const LOOKUPSWITCH: u8 = 0xab;
const WIDE: u8 = 0xc4;
const IINC: u8 = 0x84;

/// Size in bytes of the instruction starting at `pc`, operands included.
pub(super) fn instruction_length(code: &[u8], pc: usize) -> Result<usize, ClassFileError> {
    let opcode = code[pc];
    let len = match opcode {
        0x00..=0x0f => 1,
        0x10 => 2,
        0x11 => 3,
        LDC => 2,
        LDC_W | 0x14 => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        IINC => 3,
        0x85..=0x98 => 1,
        0x99..=0xa8 => 3,
        0xa9 => 2,
        TABLESWITCH => {
            let operands = pc + 1 + padding(pc);
            let low = read_i32(code, operands + 4)?;
            let high = read_i32(code, operands + 8)?;
            if high < low {
                return Err(ClassFileError::BadSwitch { pc });
            }
            let targets = (i64::from(high) - i64::from(low) + 1) as usize;
            operands - pc + 12 + targets * 4
        }
        LOOKUPSWITCH => {
            let operands = pc + 1 + padding(pc);
            let pairs = read_i32(code, operands + 4)?;
            let pairs = usize::try_from(pairs).map_err(|_| ClassFileError::BadSwitch { pc })?;
            operands - pc + 8 + pairs * 8
        }
        0xac..=0xb1 => 1,
        GETSTATIC..=0xb8 => 3,
        INVOKEINTERFACE | 0xba => 5,
        NEW => 3,
        0xbc => 2,
        ANEWARRAY => 3,
        0xbe | 0xbf => 1,
        CHECKCAST | INSTANCEOF => 3,
        0xc2 | 0xc3 => 1,
        WIDE => match code.get(pc + 1) {
            Some(&IINC) => 6,
            Some(_) => 4,
            None => return Err(ClassFileError::Truncated(pc)),
        },
        MULTIANEWARRAY => 4,
        0xc6 | 0xc7 => 3,
        0xc8 | 0xc9 => 5,
        0xca | 0xfe | 0xff => 1,
        opcode => return Err(ClassFileError::UnknownOpcode { opcode, pc }),
    };
    Ok(len)
}

/// Switch operands start on a 4-byte boundary relative to the start of the code.
fn padding(pc: usize) -> usize {
    (4 - (pc + 1) % 4) % 4
}

fn read_i32(code: &[u8], at: usize) -> Result<i32, ClassFileError> {
    code.get(at..at + 4)
        .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(ClassFileError::Truncated(at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_instructions() {
        assert_eq!(instruction_length(&[0xb1], 0).unwrap(), 1);
        assert_eq!(instruction_length(&[0xb9, 0, 1, 1, 0], 0).unwrap(), 5);
        assert_eq!(instruction_length(&[0xc4, 0x84, 0, 1, 0, 1], 0).unwrap(), 6);
        assert_eq!(instruction_length(&[0xc4, 0x15, 0, 1], 0).unwrap(), 4);
    }

    #[test]
    fn lookupswitch_is_padded_from_code_start() {
        // nop at 0, lookupswitch at 1: operands begin at 4, one pair.
        let mut code = vec![0x00, LOOKUPSWITCH, 0, 0];
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&1i32.to_be_bytes());
        code.extend_from_slice(&[0; 8]);
        assert_eq!(instruction_length(&code, 1).unwrap(), 3 + 8 + 8);
    }

    #[test]
    fn rejects_unknown_opcodes() {
        assert_eq!(
            instruction_length(&[0xcb], 0).unwrap_err(),
            ClassFileError::UnknownOpcode { opcode: 0xcb, pc: 0 }
        );
    }
}
