//! Error handling infrastructure shared by the index crates.
//!
//! Every subsystem (page store, index engine) declares its error enum
//! through `define_index_error!`. The macro assigns each variant a stable
//! `u16` code with the subsystem byte in the high half, so a logged
//! `E0105` pins down both the layer and the failure without symbol
//! information.
//!
//! Plain failures and propagated ones are declared in separate sections:
//! variants in the `propagates` block wrap a lower subsystem's error and
//! get a `From` conversion (so `?` crosses the layer boundary) plus a
//! `source()` chain for free.
//!
//! ```ignore
//! define_index_error! {
//!     pub enum ColaError(0x01) {
//!         Unsupported = 0x01 => "Operation not supported",
//!         CorruptMeta = 0x05 => "Meta page magic mismatch",
//!     }
//!     propagates {
//!         Store(StoreError) = 0x09 => "Page store failure",
//!     }
//! }
//! ```

#![no_std]

/// Define an index-subsystem error enum.
///
/// Takes the subsystem byte, a section of plain variants, and an optional
/// `propagates` section of variants wrapping a lower layer's error type.
#[macro_export]
macro_rules! define_index_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($subsystem:literal) {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident = $code:literal => $message:literal
            ),* $(,)?
        }
        $(propagates {
            $(
                $(#[$wrap_meta:meta])*
                $wrap:ident($inner:ty) = $wrap_code:literal => $wrap_message:literal
            ),* $(,)?
        })?
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant,
            )*
            $($(
                $(#[$wrap_meta])*
                $wrap($inner),
            )*)?
        }

        impl $name {
            /// Stable numeric code: subsystem byte in the high half,
            /// variant code in the low half.
            pub const fn code(&self) -> u16 {
                (($subsystem as u16) << 8)
                    | match self {
                        $(Self::$variant => $code,)*
                        $($(Self::$wrap(_) => $wrap_code,)*)?
                    }
            }

            /// Short description for logging.
            pub const fn message(&self) -> &'static str {
                match self {
                    $(Self::$variant => $message,)*
                    $($(Self::$wrap(_) => $wrap_message,)*)?
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{} [E{:04X}]", self.message(), self.code())?;
                match self {
                    $($(Self::$wrap(cause) => write!(f, ": {}", cause),)*)?
                    _ => Ok(()),
                }
            }
        }

        impl core::error::Error for $name {
            fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
                match self {
                    $($(Self::$wrap(cause) => Some(cause),)*)?
                    _ => None,
                }
            }
        }

        $($(
            impl From<$inner> for $name {
                fn from(cause: $inner) -> Self {
                    Self::$wrap(cause)
                }
            }
        )*)?
    };
}
