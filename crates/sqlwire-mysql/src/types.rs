//! MySQL column metadata.
//!
//! Field type codes and column flags carried by column definition packets.
//! The text protocol transmits every value as bytes; these types only
//! describe what the server says the column holds.

use serde::Serialize;

macro_rules! field_types {
    ($($(#[$doc:meta])* $variant:ident = $code:literal,)+) => {
        /// Column type code (`MYSQL_TYPE_*`) from a column definition.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
        #[repr(u8)]
        pub enum FieldType {
            $($(#[$doc])* $variant = $code,)+
        }

        impl FieldType {
            /// Map a wire type code to a field type. Codes this client does
            /// not know are reported as `String`, since text rows carry them
            /// as plain bytes anyway.
            #[must_use]
            pub fn from_u8(value: u8) -> Self {
                match value {
                    $($code => FieldType::$variant,)+
                    _ => FieldType::String,
                }
            }
        }
    };
}

field_types! {
    /// Old-style DECIMAL
    Decimal = 0x00,
    /// TINYINT
    Tiny = 0x01,
    /// SMALLINT
    Short = 0x02,
    /// INT
    Long = 0x03,
    /// FLOAT
    Float = 0x04,
    /// DOUBLE
    Double = 0x05,
    /// Literal NULL
    Null = 0x06,
    /// TIMESTAMP
    Timestamp = 0x07,
    /// BIGINT
    LongLong = 0x08,
    /// MEDIUMINT
    Int24 = 0x09,
    /// DATE
    Date = 0x0A,
    /// TIME
    Time = 0x0B,
    /// DATETIME
    DateTime = 0x0C,
    /// YEAR
    Year = 0x0D,
    /// Server-internal DATE
    NewDate = 0x0E,
    /// VARCHAR
    VarChar = 0x0F,
    /// BIT
    Bit = 0x10,
    /// Fractional-second TIMESTAMP
    Timestamp2 = 0x11,
    /// Fractional-second DATETIME
    DateTime2 = 0x12,
    /// Fractional-second TIME
    Time2 = 0x13,
    /// JSON
    Json = 0xF5,
    /// DECIMAL / NUMERIC
    NewDecimal = 0xF6,
    /// ENUM
    Enum = 0xF7,
    /// SET
    Set = 0xF8,
    /// TINYBLOB / TINYTEXT
    TinyBlob = 0xF9,
    /// MEDIUMBLOB / MEDIUMTEXT
    MediumBlob = 0xFA,
    /// LONGBLOB / LONGTEXT
    LongBlob = 0xFB,
    /// BLOB / TEXT
    Blob = 0xFC,
    /// VARCHAR / VARBINARY as sent in results
    VarString = 0xFD,
    /// CHAR / BINARY
    String = 0xFE,
    /// GEOMETRY
    Geometry = 0xFF,
}

/// Bits of the `flags` field of a column definition.
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// One column definition packet of a result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDefinition {
    /// Always "def"
    pub catalog: String,
    pub schema: String,
    /// Table alias as written in the query
    pub table: String,
    pub org_table: String,
    /// Column alias as written in the query
    pub name: String,
    pub org_name: String,
    /// Collation id of the column
    pub charset: u16,
    /// Maximum display length
    pub column_length: u32,
    pub column_type: FieldType,
    /// See [`column_flags`]
    pub flags: u16,
    pub decimals: u8,
}
