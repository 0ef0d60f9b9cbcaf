// Shared tagged-value ABI constants for the native backend and its runtime.

pub const WORD_SIZE: i32 = 8;

pub const SMI_TAG_SIZE: u32 = 1;
pub const SMI_TAG_MASK: u64 = 1;
pub const HEAP_OBJECT_TAG: i64 = 1;
pub const FAILURE_TAG: u64 = 3;
pub const FAILURE_TAG_MASK: u64 = 3;
pub const FAILURE_KIND_SHIFT: u32 = 2;

/// Smis are kept to 31 bits so snapshots stay loadable on 32-bit runtimes.
pub const PORTABLE_SMI_BITS: u32 = 31;
pub const PORTABLE_SMI_MIN: i64 = -(1 << (PORTABLE_SMI_BITS - 1));
pub const PORTABLE_SMI_MAX: i64 = (1 << (PORTABLE_SMI_BITS - 1)) - 1;

pub const HEAP_OBJECT_CLASS_OFFSET: i32 = 0;

pub const CLASS_SUPER_CLASS_OFFSET: i32 = 8;
pub const CLASS_INSTANCE_FORMAT_OFFSET: i32 = 16;
pub const CLASS_ID_OFFSET: i32 = 24;
pub const CLASS_CHILD_ID_OFFSET: i32 = 32;
pub const CLASS_METHODS_OFFSET: i32 = 40;
pub const CLASS_SIZE: i32 = 48;

pub const FUNCTION_BYTECODE_SIZE_OFFSET: i32 = 8;
pub const FUNCTION_LITERALS_SIZE_OFFSET: i32 = 16;
pub const FUNCTION_ARITY_OFFSET: i32 = 24;
pub const FUNCTION_CODE_OFFSET: i32 = 32;
pub const FUNCTION_SIZE: i32 = 40;

pub const INSTANCE_FLAGS_OFFSET: i32 = 8;
pub const INSTANCE_HEADER_SIZE: i32 = 16;
pub const INSTANCE_FLAG_IMMUTABLE: u64 = 1 << 1;

pub const ARRAY_LENGTH_OFFSET: i32 = 8;
pub const ARRAY_HEADER_SIZE: i32 = 16;
pub const ARRAY_HEADER_WORDS: i64 = (ARRAY_HEADER_SIZE / WORD_SIZE) as i64;

pub const STRING_HASH_OFFSET: i32 = 16;
pub const STRING_HEADER_SIZE: i32 = 24;

pub const BOXED_VALUE_OFFSET: i32 = 8;
pub const BOXED_SIZE: i32 = 16;

pub const LARGE_INTEGER_VALUE_OFFSET: i32 = 8;
pub const DOUBLE_VALUE_OFFSET: i32 = 8;
pub const NUMBER_SIZE: i32 = 16;

pub const INITIALIZER_FUNCTION_OFFSET: i32 = 8;
pub const INITIALIZER_SIZE: i32 = 16;

pub const DISPATCH_ENTRY_TARGET_OFFSET: i32 = 8;
pub const DISPATCH_ENTRY_CODE_OFFSET: i32 = 16;
pub const DISPATCH_ENTRY_OFFSET_OFFSET: i32 = 24;
pub const DISPATCH_ENTRY_SELECTOR_OFFSET: i32 = 32;
pub const DISPATCH_ENTRY_SIZE: i32 = 40;

/// Index of the no-such-method entry inside the dispatch table.
pub const DISPATCH_NSM_INDEX: i64 = 0;

pub const INSTANCE_FORMAT_TYPE_BITS: u32 = 4;
pub const INSTANCE_FORMAT_TYPE_MASK: i64 = (1 << INSTANCE_FORMAT_TYPE_BITS) - 1;

// Prefix of the runtime's process record that generated code reads directly.
pub const PROCESS_STATICS_OFFSET: i32 = 0;
pub const PROCESS_HEAP_BASE_OFFSET: i32 = 8;
pub const PROCESS_CARD_TABLE_OFFSET: i32 = 16;
pub const PROCESS_CARD_COUNT_OFFSET: i32 = 24;
pub const PROCESS_SCRATCH_CARD_OFFSET: i32 = 32;
pub const PROCESS_FAILURE_CLASS_OFFSET: i32 = 40;

pub const CARD_SHIFT: i64 = 9;
pub const CARD_SIZE: usize = 1 << CARD_SHIFT;

/// Operand-stack slots between the arguments and the locals of a frame.
pub const FRAME_AUX_SLOTS: u32 = 3;

pub const FAILURE_RETRY_AFTER_GC: u64 = 0;
pub const FAILURE_WRONG_ARGUMENT_TYPE: u64 = 1;
pub const FAILURE_INDEX_OUT_OF_BOUNDS: u64 = 2;
pub const FAILURE_ILLEGAL_STATE: u64 = 3;

pub const fn smi(value: i64) -> u64 {
    (value << SMI_TAG_SIZE) as u64
}

pub const fn smi_value(word: u64) -> i64 {
    (word as i64) >> SMI_TAG_SIZE
}

pub const fn is_smi(word: u64) -> bool {
    word & SMI_TAG_MASK == 0
}

pub const fn is_portable_smi(value: i64) -> bool {
    value >= PORTABLE_SMI_MIN && value <= PORTABLE_SMI_MAX
}

pub const fn is_failure(word: u64) -> bool {
    word & FAILURE_TAG_MASK == FAILURE_TAG
}

pub const fn failure(kind: u64) -> u64 {
    (kind << FAILURE_KIND_SHIFT) | FAILURE_TAG
}

pub const fn failure_kind(word: u64) -> u64 {
    word >> FAILURE_KIND_SHIFT
}

pub const fn tag_address(address: u64) -> u64 {
    address + HEAP_OBJECT_TAG as u64
}

pub const fn untag_address(word: u64) -> u64 {
    word - HEAP_OBJECT_TAG as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smi_tagging_round_trips_portable_range() {
        let mut value = PORTABLE_SMI_MIN;
        while value <= PORTABLE_SMI_MAX {
            assert_eq!(smi_value(smi(value)), value);
            assert!(is_smi(smi(value)));
            value += 65_521;
        }
        for edge in [PORTABLE_SMI_MIN, -1, 0, 1, PORTABLE_SMI_MAX] {
            assert_eq!(smi_value(smi(edge)), edge);
        }
    }

    #[test]
    fn tagging_is_doubling() {
        assert_eq!(smi(7), 14);
        assert_eq!(smi(-3) as i64, -6);
        assert_eq!(smi(21), 21u64.wrapping_add(21));
    }

    #[test]
    fn failure_words_are_never_smis_or_objects() {
        let word = failure(FAILURE_WRONG_ARGUMENT_TYPE);
        assert!(is_failure(word));
        assert!(!is_smi(word));
        assert_eq!(failure_kind(word), FAILURE_WRONG_ARGUMENT_TYPE);
        assert!(!is_failure(tag_address(0x1000)));
        assert!(!is_failure(smi(5)));
    }

    #[test]
    fn portable_range_is_thirty_one_bits() {
        assert!(is_portable_smi(PORTABLE_SMI_MAX));
        assert!(!is_portable_smi(PORTABLE_SMI_MAX + 1));
        assert!(is_portable_smi(PORTABLE_SMI_MIN));
        assert!(!is_portable_smi(PORTABLE_SMI_MIN - 1));
    }
}
