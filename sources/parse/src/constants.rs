pub const MAGIC: u32 = 0xCAFEBABE;

pub const CODE_ATTRIBUTE: &str = "Code";
pub const LINE_NUMBER_TABLE_ATTRIBUTE: &str = "LineNumberTable";
pub const SOURCE_FILE_ATTRIBUTE: &str = "SourceFile";

pub const CONSTRUCTOR_NAME: &str = "<init>";
pub const STATIC_INITIALIZER_NAME: &str = "<clinit>";

/// Highest index a u2 constant pool count can describe.
pub const MAX_POOL_COUNT: usize = 0xFFFF;

/// Code arrays must fit a u2 exception table index range.
pub const MAX_CODE_LENGTH: usize = 0xFFFF;

/// Bytes from the start of a Code attribute's name index to its code array:
/// name (2) + length (4) + max_stack (2) + max_locals (2) + code_length (4).
pub const CODE_HEADER_LENGTH: usize = 14;
