//! The handful of opcodes the engine reads or emits, and predicates over
//! opcode families.

pub const NOP: u8 = 0x00;
pub const ACONST_NULL: u8 = 0x01;
pub const ICONST_0: u8 = 0x03;
pub const ICONST_1: u8 = 0x04;
pub const BIPUSH: u8 = 0x10;
pub const SIPUSH: u8 = 0x11;
pub const ILOAD: u8 = 0x15;
pub const LLOAD: u8 = 0x16;
pub const FLOAD: u8 = 0x17;
pub const DLOAD: u8 = 0x18;
pub const ALOAD: u8 = 0x19;
pub const ILOAD_0: u8 = 0x1a;
pub const ILOAD_1: u8 = 0x1b;
pub const LLOAD_0: u8 = 0x1e;
pub const LLOAD_2: u8 = 0x20;
pub const FLOAD_0: u8 = 0x22;
pub const DLOAD_0: u8 = 0x26;
pub const ALOAD_0: u8 = 0x2a;
pub const ALOAD_1: u8 = 0x2b;
pub const ASTORE: u8 = 0x3a;
pub const ASTORE_1: u8 = 0x4c;
pub const POP: u8 = 0x57;
pub const DUP: u8 = 0x59;
pub const DUP_X1: u8 = 0x5a;
pub const DUP_X2: u8 = 0x5b;
pub const IINC: u8 = 0x84;

pub const IFEQ: u8 = 0x99;
pub const IFNE: u8 = 0x9a;
pub const IF_ACMPNE: u8 = 0xa6;
pub const GOTO: u8 = 0xa7;
pub const JSR: u8 = 0xa8;
pub const RET: u8 = 0xa9;
pub const TABLESWITCH: u8 = 0xaa;
pub const LOOKUPSWITCH: u8 = 0xab;

pub const IRETURN: u8 = 0xac;
pub const ARETURN: u8 = 0xb0;
pub const RETURN: u8 = 0xb1;

pub const INVOKEVIRTUAL: u8 = 0xb6;
pub const INVOKESPECIAL: u8 = 0xb7;
pub const INVOKESTATIC: u8 = 0xb8;
pub const INVOKEINTERFACE: u8 = 0xb9;
pub const INVOKEDYNAMIC: u8 = 0xba;

pub const NEW: u8 = 0xbb;
pub const NEWARRAY: u8 = 0xbc;
pub const ANEWARRAY: u8 = 0xbd;
pub const ATHROW: u8 = 0xbf;
pub const WIDE: u8 = 0xc4;
pub const MULTIANEWARRAY: u8 = 0xc5;
pub const IFNULL: u8 = 0xc6;
pub const IFNONNULL: u8 = 0xc7;
pub const GOTO_W: u8 = 0xc8;
pub const JSR_W: u8 = 0xc9;

/// Branches carrying a signed 16 bit offset that may need widening.
pub fn is_short_branch(opcode: u8) -> bool {
    is_conditional(opcode) || opcode == GOTO || opcode == JSR
}

pub fn is_conditional(opcode: u8) -> bool {
    matches!(opcode, IFEQ..=IF_ACMPNE | IFNULL | IFNONNULL)
}

pub fn is_return(opcode: u8) -> bool {
    matches!(opcode, IRETURN..=RETURN)
}

pub fn is_invoke(opcode: u8) -> bool {
    matches!(opcode, INVOKEVIRTUAL..=INVOKEDYNAMIC)
}

pub fn is_dup(opcode: u8) -> bool {
    matches!(opcode, DUP | DUP_X1 | DUP_X2)
}

/// The conditional with the opposite outcome. Conditionals come in adjacent
/// pairs, the first of each at an even distance from `ifeq`.
pub fn negate(opcode: u8) -> Option<u8> {
    match opcode {
        IFEQ..=IF_ACMPNE if (opcode - IFEQ) % 2 == 0 => Some(opcode + 1),
        IFEQ..=IF_ACMPNE => Some(opcode - 1),
        IFNULL => Some(IFNONNULL),
        IFNONNULL => Some(IFNULL),
        _ => None,
    }
}

/// The 32 bit offset form of an unconditional short branch.
pub fn widened(opcode: u8) -> Option<u8> {
    match opcode {
        GOTO => Some(GOTO_W),
        JSR => Some(JSR_W),
        _ => None,
    }
}
