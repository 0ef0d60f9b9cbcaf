//! Runtime services linked into compiled kiln programs.
//!
//! Generated code reads the `Process` prefix directly (statics, heap base,
//! card table) and calls the `Handle*` services when allocation or native
//! failures need the runtime. Objects are never moved: a collection opens a
//! fresh heap chunk and retires the old one.

#![allow(non_snake_case)]

use kiln_core::abi;
use kiln_core::heap::InstanceFormat;

pub const DEFAULT_HEAP_BYTES: usize = 1 << 20;

/// Process record. Field order and offsets are part of the generated-code ABI
/// up to and including `failure_class`.
#[repr(C)]
#[derive(Debug)]
pub struct Process {
    /// Tagged static-fields array.
    pub statics: u64,
    pub heap_base: u64,
    pub card_table: u64,
    pub card_count: u64,
    /// Card byte for writes outside the heap.
    pub scratch_card: u8,
    /// Class of the objects built from native failures.
    pub failure_class: u64,
    /// Class of `AllocateBoxed` results.
    pub boxed_class: u64,
    heap: Heap,
}

#[derive(Debug)]
struct Chunk {
    /// Backing store, always a whole number of cards.
    words: Vec<u64>,
    cards: Vec<u8>,
    capacity: usize,
    top: usize,
}

impl Chunk {
    fn new(bytes: usize) -> Self {
        let capacity = bytes.div_ceil(8).max(1);
        let cards = (capacity * 8).div_ceil(abi::CARD_SIZE);
        // No other chunk may fall inside the address range of these cards.
        Self {
            words: vec![0; cards * abi::CARD_SIZE / 8],
            cards: vec![0; cards],
            capacity,
            top: 0,
        }
    }

    fn base(&self) -> u64 {
        self.words.as_ptr() as u64
    }

    fn allocate(&mut self, words: usize) -> Option<u64> {
        let end = self.top.checked_add(words)?;
        if end > self.capacity {
            return None;
        }
        let address = self.base() + (self.top as u64) * 8;
        self.top = end;
        Some(address)
    }
}

#[derive(Debug)]
struct Heap {
    current: Chunk,
    retired: Vec<Chunk>,
    chunk_bytes: usize,
    collections: u64,
}

impl Heap {
    fn chunk_words(&self) -> usize {
        self.current.capacity
    }
}

impl Process {
    pub fn new() -> Self {
        Self::with_heap_bytes(DEFAULT_HEAP_BYTES)
    }

    pub fn with_heap_bytes(bytes: usize) -> Self {
        let mut process = Self {
            statics: 0,
            heap_base: 0,
            card_table: 0,
            card_count: 0,
            scratch_card: 0,
            failure_class: 0,
            boxed_class: 0,
            heap: Heap {
                current: Chunk::new(bytes),
                retired: Vec::new(),
                chunk_bytes: bytes,
                collections: 0,
            },
        };
        process.publish_heap();
        process
    }

    fn publish_heap(&mut self) {
        let chunk = &mut self.heap.current;
        self.heap_base = chunk.base();
        self.card_table = chunk.cards.as_mut_ptr() as u64;
        self.card_count = chunk.cards.len() as u64;
    }

    /// Bump-allocates `words` zeroed words, or `None` when the chunk is full.
    pub fn allocate_words(&mut self, words: usize) -> Option<u64> {
        self.heap.current.allocate(words)
    }

    /// Retires the current chunk and opens a fresh one. Returns the number of
    /// collections so far.
    pub fn collect(&mut self) -> u64 {
        let fresh = Chunk::new(self.heap.chunk_bytes);
        let old = std::mem::replace(&mut self.heap.current, fresh);
        self.heap.retired.push(old);
        self.heap.collections += 1;
        self.publish_heap();
        log::debug!("collection {}: opened a fresh heap chunk", self.heap.collections);
        self.heap.collections
    }

    pub fn collections(&self) -> u64 {
        self.heap.collections
    }

    /// Cards dirtied in the current chunk.
    pub fn dirty_cards(&self) -> Vec<usize> {
        self.heap
            .current
            .cards
            .iter()
            .enumerate()
            .filter(|(_, &card)| card != 0)
            .map(|(index, _)| index)
            .collect()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.heap.current.top * 8
    }

    /// Failure word for a request of `words` the current chunk could not
    /// serve: retry after a collection, unless no fresh chunk can hold it.
    fn allocation_failure(&self, words: usize) -> u64 {
        if words > self.heap.chunk_words() {
            abi::failure(abi::FAILURE_ILLEGAL_STATE)
        } else {
            abi::failure(abi::FAILURE_RETRY_AFTER_GC)
        }
    }

    fn allocate_object(&mut self, class: u64, words: usize) -> Option<u64> {
        let address = self.allocate_words(words)?;
        // SAFETY: `address` points at `words` freshly reserved words of the current chunk.
        unsafe { *(address as *mut u64) = class };
        Some(abi::tag_address(address))
    }

    fn allocate_or_collect(&mut self, class: u64, words: usize) -> u64 {
        match self.allocate_object(class, words) {
            Some(object) => object,
            None => {
                self.collect();
                self.allocate_object(class, words)
                    .unwrap_or(abi::failure(abi::FAILURE_RETRY_AFTER_GC))
            }
        }
    }
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}

fn process_mut<'a>(ptr: *mut Process) -> &'a mut Process {
    unsafe { &mut *ptr }
}

/// Reads the word at `offset` inside the tagged heap object `object`.
fn read_field(object: u64, offset: i32) -> u64 {
    let address = abi::untag_address(object) as i64 + i64::from(offset);
    unsafe { *(address as *const u64) }
}

fn write_field(object: u64, offset: i32, value: u64) {
    let address = abi::untag_address(object) as i64 + i64::from(offset);
    unsafe { *(address as *mut u64) = value };
}

fn instance_fields(class: u64) -> usize {
    let format = read_field(class, abi::CLASS_INSTANCE_FORMAT_OFFSET);
    InstanceFormat::decode_fields(abi::smi_value(format)) as usize
}

/// Allocates an instance of `class` with zeroed fields. Answers the
/// retry-after-GC failure when the current chunk is exhausted, and the
/// illegal-state failure when the instance is larger than any chunk.
#[no_mangle]
pub extern "C-unwind" fn HandleAllocate(process: *mut Process, class: u64, immutable: u64) -> u64 {
    let process = process_mut(process);
    let words = abi::INSTANCE_HEADER_SIZE as usize / 8 + instance_fields(class);
    match process.allocate_object(class, words) {
        Some(object) => {
            let flags = if immutable != 0 { abi::INSTANCE_FLAG_IMMUTABLE } else { 0 };
            write_field(object, abi::INSTANCE_FLAGS_OFFSET, flags);
            object
        }
        None => process.allocation_failure(words),
    }
}

#[no_mangle]
pub extern "C-unwind" fn HandleAllocateBoxed(process: *mut Process, value: u64) -> u64 {
    let process = process_mut(process);
    let class = process.boxed_class;
    let words = abi::BOXED_SIZE as usize / 8;
    match process.allocate_object(class, words) {
        Some(object) => {
            write_field(object, abi::BOXED_VALUE_OFFSET, value);
            object
        }
        None => process.allocation_failure(words),
    }
}

/// Turns a failure word into a heap object holding the failure kind as a smi.
#[no_mangle]
pub extern "C-unwind" fn HandleObjectFromFailure(process: *mut Process, failure: u64) -> u64 {
    let process = process_mut(process);
    let class = process.failure_class;
    let object = process.allocate_or_collect(class, abi::BOXED_SIZE as usize / 8);
    if abi::is_failure(object) {
        return object;
    }
    write_field(object, abi::BOXED_VALUE_OFFSET, abi::smi(abi::failure_kind(failure) as i64));
    object
}

#[no_mangle]
pub extern "C-unwind" fn HandleGC(process: *mut Process) {
    process_mut(process).collect();
}

/// Argument `index` of a native call; natives index backwards from `args`.
fn native_arg(args: *const u64, index: usize) -> u64 {
    unsafe { *args.sub(index) }
}

fn smi_result(value: i64) -> u64 {
    if abi::is_portable_smi(value) {
        abi::smi(value)
    } else {
        abi::failure(abi::FAILURE_ILLEGAL_STATE)
    }
}

#[no_mangle]
pub extern "C-unwind" fn Native_SmiAdd(_process: *mut Process, args: *const u64) -> u64 {
    let (lhs, rhs) = (native_arg(args, 0), native_arg(args, 1));
    if !abi::is_smi(lhs) || !abi::is_smi(rhs) {
        return abi::failure(abi::FAILURE_WRONG_ARGUMENT_TYPE);
    }
    smi_result(abi::smi_value(lhs) + abi::smi_value(rhs))
}

#[no_mangle]
pub extern "C-unwind" fn Native_SmiSub(_process: *mut Process, args: *const u64) -> u64 {
    let (lhs, rhs) = (native_arg(args, 0), native_arg(args, 1));
    if !abi::is_smi(lhs) || !abi::is_smi(rhs) {
        return abi::failure(abi::FAILURE_WRONG_ARGUMENT_TYPE);
    }
    smi_result(abi::smi_value(lhs) - abi::smi_value(rhs))
}

#[no_mangle]
pub extern "C-unwind" fn Native_ArrayLength(_process: *mut Process, args: *const u64) -> u64 {
    let array = native_arg(args, 0);
    if abi::is_smi(array) {
        return abi::failure(abi::FAILURE_WRONG_ARGUMENT_TYPE);
    }
    read_field(array, abi::ARRAY_LENGTH_OFFSET)
}

#[no_mangle]
pub extern "C-unwind" fn Native_Fail(_process: *mut Process, _args: *const u64) -> u64 {
    abi::failure(abi::FAILURE_ILLEGAL_STATE)
}

/// Runtime entry points by linker symbol, for in-process code generation.
pub fn symbols() -> Vec<(&'static str, *const u8)> {
    vec![
        ("HandleAllocate", HandleAllocate as *const u8),
        ("HandleAllocateBoxed", HandleAllocateBoxed as *const u8),
        ("HandleObjectFromFailure", HandleObjectFromFailure as *const u8),
        ("HandleGC", HandleGC as *const u8),
        ("Native_SmiAdd", Native_SmiAdd as *const u8),
        ("Native_SmiSub", Native_SmiSub as *const u8),
        ("Native_ArrayLength", Native_ArrayLength as *const u8),
        ("Native_Fail", Native_Fail as *const u8),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::InstanceType;
    use std::mem::offset_of;

    /// A class object laid out the way the image lays it out.
    fn class_with_fields(fields: u32) -> Vec<u64> {
        let mut class = vec![0u64; abi::CLASS_SIZE as usize / 8];
        let format = InstanceFormat::new(InstanceType::Instance, fields).encode();
        class[abi::CLASS_INSTANCE_FORMAT_OFFSET as usize / 8] = abi::smi(format);
        class
    }

    #[test]
    fn process_prefix_matches_generated_code_offsets() {
        assert_eq!(offset_of!(Process, statics), abi::PROCESS_STATICS_OFFSET as usize);
        assert_eq!(offset_of!(Process, heap_base), abi::PROCESS_HEAP_BASE_OFFSET as usize);
        assert_eq!(offset_of!(Process, card_table), abi::PROCESS_CARD_TABLE_OFFSET as usize);
        assert_eq!(offset_of!(Process, card_count), abi::PROCESS_CARD_COUNT_OFFSET as usize);
        assert_eq!(offset_of!(Process, scratch_card), abi::PROCESS_SCRATCH_CARD_OFFSET as usize);
        assert_eq!(offset_of!(Process, failure_class), abi::PROCESS_FAILURE_CLASS_OFFSET as usize);
    }

    #[test]
    fn allocate_lays_out_header_and_zeroed_fields() {
        let mut process = Process::new();
        let class = class_with_fields(3);
        let class_ref = abi::tag_address(class.as_ptr() as u64);
        let object = HandleAllocate(&mut process, class_ref, 1);
        assert!(!abi::is_failure(object));
        assert_eq!(object & abi::SMI_TAG_MASK, 1);
        assert_eq!(read_field(object, abi::HEAP_OBJECT_CLASS_OFFSET), class_ref);
        assert_eq!(read_field(object, abi::INSTANCE_FLAGS_OFFSET), abi::INSTANCE_FLAG_IMMUTABLE);
        assert_eq!(read_field(object, abi::INSTANCE_HEADER_SIZE + 16), 0);
        assert_eq!(process.bytes_allocated(), 40);
    }

    #[test]
    fn exhausted_chunk_answers_retry_until_collected() {
        let mut process = Process::with_heap_bytes(64);
        let class = class_with_fields(4);
        let class_ref = abi::tag_address(class.as_ptr() as u64);
        assert!(!abi::is_failure(HandleAllocate(&mut process, class_ref, 0)));
        let failed = HandleAllocate(&mut process, class_ref, 0);
        assert!(abi::is_failure(failed));
        assert_eq!(abi::failure_kind(failed), abi::FAILURE_RETRY_AFTER_GC);

        let old_base = process.heap_base;
        HandleGC(&mut process);
        assert_eq!(process.collections(), 1);
        assert_ne!(process.heap_base, old_base);
        assert!(!abi::is_failure(HandleAllocate(&mut process, class_ref, 0)));
    }

    #[test]
    fn instances_larger_than_a_chunk_fail_without_retry() {
        let mut process = Process::with_heap_bytes(16);
        let class = class_with_fields(2);
        let class_ref = abi::tag_address(class.as_ptr() as u64);
        let failed = HandleAllocate(&mut process, class_ref, 0);
        assert!(abi::is_failure(failed));
        assert_eq!(abi::failure_kind(failed), abi::FAILURE_ILLEGAL_STATE);
        assert_eq!(process.bytes_allocated(), 0);

        // A boxed value still fits the same chunk.
        process.boxed_class = class_ref;
        assert!(!abi::is_failure(HandleAllocateBoxed(&mut process, abi::smi(1))));
    }

    #[test]
    fn published_cards_cover_only_the_current_chunk() {
        let mut process = Process::with_heap_bytes(32);
        assert_eq!(process.card_count, 1);
        let old_base = process.heap_base;
        HandleGC(&mut process);
        let covered = process.card_count * abi::CARD_SIZE as u64;
        // The barrier sends any slot outside this range to the scratch card.
        assert!(old_base.wrapping_sub(process.heap_base) >= covered);
        assert_eq!(process.heap.current.words.len() as u64 * 8, covered);
    }

    #[test]
    fn failure_objects_carry_the_failure_kind() {
        let mut process = Process::new();
        let class = class_with_fields(1);
        process.failure_class = abi::tag_address(class.as_ptr() as u64);
        let object = HandleObjectFromFailure(&mut process, abi::failure(abi::FAILURE_INDEX_OUT_OF_BOUNDS));
        assert_eq!(read_field(object, abi::HEAP_OBJECT_CLASS_OFFSET), process.failure_class);
        assert_eq!(
            read_field(object, abi::BOXED_VALUE_OFFSET),
            abi::smi(abi::FAILURE_INDEX_OUT_OF_BOUNDS as i64)
        );
    }

    #[test]
    fn natives_read_arguments_backwards() {
        let mut process = Process::new();
        // Buffer order as generated code stores it: last argument first.
        let buffer = [abi::smi(10), abi::smi(3)];
        let last = unsafe { buffer.as_ptr().add(1) };
        assert_eq!(Native_SmiSub(&mut process, last), abi::smi(3 - 10));
        assert_eq!(Native_SmiAdd(&mut process, last), abi::smi(13));

        let bad = [abi::smi(1), abi::tag_address(buffer.as_ptr() as u64)];
        let last = unsafe { bad.as_ptr().add(1) };
        let failed = Native_SmiAdd(&mut process, last);
        assert_eq!(abi::failure_kind(failed), abi::FAILURE_WRONG_ARGUMENT_TYPE);
    }

    #[test]
    fn native_results_outside_the_portable_range_fail() {
        let mut process = Process::new();
        let buffer = [abi::smi(abi::PORTABLE_SMI_MAX), abi::smi(1)];
        let last = unsafe { buffer.as_ptr().add(1) };
        assert!(abi::is_failure(Native_SmiAdd(&mut process, last)));
    }
}
