use std::fmt;
use std::fmt::Write as _;

/// Operand layout following the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// No operands.
    Empty,
    /// One unsigned byte.
    B,
    /// One little-endian 32-bit integer.
    I,
    BB,
    BI,
    II,
}

impl Format {
    pub fn size(self) -> u32 {
        match self {
            Format::Empty => 1,
            Format::B => 2,
            Format::I => 5,
            Format::BB => 3,
            Format::BI => 6,
            Format::II => 9,
        }
    }
}

macro_rules! opcodes {
    ($( $name:ident = $byte:literal, $mnemonic:literal, $format:ident, $effect:expr; )*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum Opcode {
            $( $name = $byte, )*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$( Opcode::$name, )*];

            pub fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $( $byte => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            pub fn format(self) -> Format {
                match self {
                    $( Opcode::$name => Format::$format, )*
                }
            }

            /// Net stack effect when it does not depend on operands.
            pub fn fixed_stack_diff(self) -> Option<i32> {
                match self {
                    $( Opcode::$name => $effect, )*
                }
            }
        }
    };
}

const VAR: Option<i32> = None;

opcodes! {
    LoadLocal0 = 0, "load local 0", Empty, Some(1);
    LoadLocal1 = 1, "load local 1", Empty, Some(1);
    LoadLocal2 = 2, "load local 2", Empty, Some(1);
    LoadLocal3 = 3, "load local 3", Empty, Some(1);
    LoadLocal4 = 4, "load local 4", Empty, Some(1);
    LoadLocal5 = 5, "load local 5", Empty, Some(1);
    LoadLocal = 6, "load local", B, Some(1);
    LoadLocalWide = 7, "load local wide", I, Some(1);
    LoadBoxed = 8, "load boxed", B, Some(1);
    LoadStatic = 9, "load static", I, Some(1);
    LoadStaticInit = 10, "load static init", I, Some(1);
    LoadField = 11, "load field", B, Some(0);
    LoadFieldWide = 12, "load field wide", I, Some(0);
    LoadConst = 13, "load const", I, Some(1);
    StoreLocal = 14, "store local", B, Some(0);
    StoreBoxed = 15, "store boxed", B, Some(0);
    StoreStatic = 16, "store static", I, Some(0);
    StoreField = 17, "store field", B, Some(-1);
    StoreFieldWide = 18, "store field wide", I, Some(-1);
    LoadLiteralNull = 19, "load literal null", Empty, Some(1);
    LoadLiteralTrue = 20, "load literal true", Empty, Some(1);
    LoadLiteralFalse = 21, "load literal false", Empty, Some(1);
    LoadLiteral0 = 22, "load literal 0", Empty, Some(1);
    LoadLiteral1 = 23, "load literal 1", Empty, Some(1);
    LoadLiteral = 24, "load literal", B, Some(1);
    LoadLiteralWide = 25, "load literal wide", I, Some(1);
    InvokeMethod = 26, "invoke method", I, VAR;
    InvokeTest = 27, "invoke test", I, Some(0);
    InvokeNoSuchMethod = 28, "invoke no such method", I, VAR;
    InvokeTestNoSuchMethod = 29, "invoke test no such method", I, Some(0);
    InvokeStatic = 30, "invoke static", I, VAR;
    InvokeFactory = 31, "invoke factory", I, VAR;
    Allocate = 32, "allocate", I, VAR;
    AllocateImmutable = 33, "allocate immutable", I, VAR;
    InvokeNative = 34, "invoke native", BB, Some(1);
    InvokeDetachableNative = 35, "invoke detachable native", BB, Some(1);
    InvokeSelector = 36, "invoke selector", B, VAR;
    Pop = 37, "pop", Empty, Some(-1);
    Drop = 38, "drop", B, VAR;
    Return = 39, "return", Empty, Some(-1);
    ReturnNull = 40, "return null", Empty, Some(0);
    BranchWide = 41, "branch wide", I, Some(0);
    BranchIfTrueWide = 42, "branch if true wide", I, Some(-1);
    BranchIfFalseWide = 43, "branch if false wide", I, Some(-1);
    BranchBack = 44, "branch back", B, Some(0);
    BranchBackIfTrue = 45, "branch back if true", B, Some(-1);
    BranchBackIfFalse = 46, "branch back if false", B, Some(-1);
    BranchBackWide = 47, "branch back wide", I, Some(0);
    BranchBackIfTrueWide = 48, "branch back if true wide", I, Some(-1);
    BranchBackIfFalseWide = 49, "branch back if false wide", I, Some(-1);
    PopAndBranchWide = 50, "pop and branch wide", BI, VAR;
    PopAndBranchBackWide = 51, "pop and branch back wide", BI, VAR;
    AllocateBoxed = 52, "allocate boxed", Empty, Some(0);
    Negate = 53, "negate", Empty, Some(0);
    StackOverflowCheck = 54, "stack overflow check", I, Some(0);
    Throw = 55, "throw", Empty, Some(0);
    SubroutineCall = 56, "subroutine call", II, VAR;
    SubroutineReturn = 57, "subroutine return", Empty, Some(-1);
    ProcessYield = 58, "process yield", Empty, Some(0);
    CoroutineChange = 59, "coroutine change", Empty, Some(-1);
    Identical = 60, "identical", Empty, Some(-1);
    IdenticalNonNumeric = 61, "identical non numeric", Empty, Some(-1);
    EnterNoSuchMethod = 62, "enter no such method", B, VAR;
    ExitNoSuchMethod = 63, "exit no such method", Empty, Some(-1);
    InvokeEq = 64, "invoke eq", I, Some(-1);
    InvokeLt = 65, "invoke lt", I, Some(-1);
    InvokeLe = 66, "invoke le", I, Some(-1);
    InvokeGt = 67, "invoke gt", I, Some(-1);
    InvokeGe = 68, "invoke ge", I, Some(-1);
    InvokeAdd = 69, "invoke add", I, Some(-1);
    InvokeSub = 70, "invoke sub", I, Some(-1);
    InvokeMod = 71, "invoke mod", I, Some(-1);
    InvokeMul = 72, "invoke mul", I, Some(-1);
    InvokeTruncDiv = 73, "invoke trunc div", I, Some(-1);
    InvokeBitNot = 74, "invoke bit not", I, Some(0);
    InvokeBitAnd = 75, "invoke bit and", I, Some(-1);
    InvokeBitOr = 76, "invoke bit or", I, Some(-1);
    InvokeBitXor = 77, "invoke bit xor", I, Some(-1);
    InvokeBitShr = 78, "invoke bit shr", I, Some(-1);
    InvokeBitShl = 79, "invoke bit shl", I, Some(-1);
    MethodEnd = 80, "method end", I, Some(0);
}

impl Opcode {
    pub fn size(self) -> u32 {
        self.format().size()
    }

    /// Any instruction that ends the linear scan of a basic block.
    pub fn is_control_transfer(self) -> bool {
        matches!(
            self,
            Opcode::BranchWide
                | Opcode::BranchIfTrueWide
                | Opcode::BranchIfFalseWide
                | Opcode::BranchBack
                | Opcode::BranchBackIfTrue
                | Opcode::BranchBackIfFalse
                | Opcode::BranchBackWide
                | Opcode::BranchBackIfTrueWide
                | Opcode::BranchBackIfFalseWide
                | Opcode::PopAndBranchWide
                | Opcode::PopAndBranchBackWide
                | Opcode::SubroutineCall
                | Opcode::SubroutineReturn
                | Opcode::Return
                | Opcode::ReturnNull
                | Opcode::ExitNoSuchMethod
                | Opcode::MethodEnd
        )
    }

    pub fn is_conditional_branch(self) -> bool {
        matches!(
            self,
            Opcode::BranchIfTrueWide
                | Opcode::BranchIfFalseWide
                | Opcode::BranchBackIfTrue
                | Opcode::BranchBackIfFalse
                | Opcode::BranchBackIfTrueWide
                | Opcode::BranchBackIfFalseWide
        )
    }

    /// Smi comparisons that may fuse with a following conditional branch.
    pub fn is_smi_comparison(self) -> bool {
        matches!(
            self,
            Opcode::InvokeEq | Opcode::InvokeLt | Opcode::InvokeLe | Opcode::InvokeGt | Opcode::InvokeGe
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown opcode {byte:#04x} at bci {bci}")]
    UnknownOpcode { bci: u32, byte: u8 },
    #[error("truncated {mnemonic} at bci {bci}")]
    Truncated { bci: u32, mnemonic: &'static str },
    #[error("bci {bci} is past the end of the bytecode")]
    OutOfBounds { bci: u32 },
}

/// One decoded instruction. Operands are kept in their encoded order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub bci: u32,
    pub opcode: Opcode,
    operands: [i64; 2],
}

impl Instruction {
    pub fn decode(code: &[u8], bci: u32) -> Result<Self, DecodeError> {
        let start = bci as usize;
        let byte = *code.get(start).ok_or(DecodeError::OutOfBounds { bci })?;
        let opcode = Opcode::from_byte(byte).ok_or(DecodeError::UnknownOpcode { bci, byte })?;
        let size = opcode.size() as usize;
        let bytes = code.get(start..start + size).ok_or(DecodeError::Truncated {
            bci,
            mnemonic: opcode.mnemonic(),
        })?;
        let read_int = |at: usize| {
            i64::from(i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]))
        };
        let operands = match opcode.format() {
            Format::Empty => [0, 0],
            Format::B => [i64::from(bytes[1]), 0],
            Format::I => [read_int(1), 0],
            Format::BB => [i64::from(bytes[1]), i64::from(bytes[2])],
            Format::BI => [i64::from(bytes[1]), read_int(2)],
            Format::II => [read_int(1), read_int(5)],
        };
        Ok(Self {
            bci,
            opcode,
            operands,
        })
    }

    pub fn operand(&self, index: usize) -> i64 {
        self.operands[index]
    }

    pub fn size(&self) -> u32 {
        self.opcode.size()
    }

    pub fn next_bci(&self) -> u32 {
        self.bci + self.size()
    }

    /// Absolute target of a branch or subroutine call, if any. May be out of
    /// range for malformed input.
    pub fn branch_target(&self) -> Option<i64> {
        let bci = i64::from(self.bci);
        match self.opcode {
            Opcode::BranchWide
            | Opcode::BranchIfTrueWide
            | Opcode::BranchIfFalseWide
            | Opcode::SubroutineCall => Some(bci + self.operands[0]),
            Opcode::BranchBack
            | Opcode::BranchBackIfTrue
            | Opcode::BranchBackIfFalse
            | Opcode::BranchBackWide
            | Opcode::BranchBackIfTrueWide
            | Opcode::BranchBackIfFalseWide => Some(bci - self.operands[0]),
            Opcode::PopAndBranchWide => Some(bci + self.operands[1]),
            Opcode::PopAndBranchBackWide => Some(bci - self.operands[1]),
            _ => None,
        }
    }

    /// Where a subroutine call resumes after the subroutine returns.
    pub fn subroutine_continuation(&self) -> Option<i64> {
        match self.opcode {
            Opcode::SubroutineCall => Some(i64::from(self.bci) + self.operands[1]),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode.mnemonic())?;
        match self.opcode.format() {
            Format::Empty => Ok(()),
            Format::B | Format::I => write!(f, " {}", self.operands[0]),
            Format::BB | Format::BI | Format::II => {
                write!(f, " {} {}", self.operands[0], self.operands[1])
            }
        }
    }
}

/// Iterates instructions from `bci` 0 until `MethodEnd` or the end of code.
pub fn instructions(code: &[u8]) -> impl Iterator<Item = Result<Instruction, DecodeError>> + '_ {
    let mut bci = 0u32;
    let mut done = false;
    std::iter::from_fn(move || {
        if done || bci as usize >= code.len() {
            return None;
        }
        let decoded = Instruction::decode(code, bci);
        match &decoded {
            Ok(instruction) => {
                bci = instruction.next_bci();
                done = instruction.opcode == Opcode::MethodEnd;
            }
            Err(_) => done = true,
        }
        Some(decoded)
    })
}

pub fn disassemble(code: &[u8]) -> Result<String, DecodeError> {
    let mut out = String::new();
    for instruction in instructions(code) {
        let instruction = instruction?;
        let _ = writeln!(out, "{:>6}: {}", instruction.bci, instruction);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_round_trip() {
        for (index, opcode) in Opcode::ALL.iter().enumerate() {
            assert_eq!(*opcode as usize, index);
            assert_eq!(Opcode::from_byte(*opcode as u8), Some(*opcode));
        }
        assert_eq!(Opcode::from_byte(0xff), None);
    }

    #[test]
    fn decode_reads_signed_wide_operands() {
        let mut code = vec![Opcode::LoadLiteralWide as u8];
        code.extend_from_slice(&(-70_000i32).to_le_bytes());
        code.push(Opcode::Return as u8);
        let first = Instruction::decode(&code, 0).unwrap();
        assert_eq!(first.opcode, Opcode::LoadLiteralWide);
        assert_eq!(first.operand(0), -70_000);
        assert_eq!(first.next_bci(), 5);
        assert_eq!(Instruction::decode(&code, 5).unwrap().opcode, Opcode::Return);
    }

    #[test]
    fn decode_reports_truncation_and_unknown_bytes() {
        let code = [Opcode::InvokeMethod as u8, 1, 0];
        assert_eq!(
            Instruction::decode(&code, 0),
            Err(DecodeError::Truncated {
                bci: 0,
                mnemonic: "invoke method"
            })
        );
        assert_eq!(
            Instruction::decode(&[0xee], 0),
            Err(DecodeError::UnknownOpcode { bci: 0, byte: 0xee })
        );
    }

    #[test]
    fn branch_targets_are_relative_to_the_instruction() {
        let mut code = vec![0; 20];
        code[10] = Opcode::BranchBack as u8;
        code[11] = 4;
        let back = Instruction::decode(&code, 10).unwrap();
        assert_eq!(back.branch_target(), Some(6));

        let mut code = vec![Opcode::PopAndBranchWide as u8, 2];
        code.extend_from_slice(&12i32.to_le_bytes());
        let pop = Instruction::decode(&code, 0).unwrap();
        assert_eq!(pop.operand(0), 2);
        assert_eq!(pop.branch_target(), Some(12));
    }

    #[test]
    fn disassembly_stops_at_method_end() {
        let mut code = vec![Opcode::LoadLiteral1 as u8, Opcode::Return as u8, Opcode::MethodEnd as u8];
        code.extend_from_slice(&0i32.to_le_bytes());
        code.push(0xee);
        let text = disassemble(&code).unwrap();
        assert_eq!(text, "     0: load literal 1\n     1: return\n     2: method end 0\n");
    }
}
