//! Bolt
//!
//! A small statically-typed, garbage-collected scripting language: a
//! single-pass type-checking compiler in front of a register VM with
//! NaN-boxed values and an incremental mark-sweep heap.
//!
//! # Embedding
//!
//! ```rust
//! use bolt::Context;
//!
//! let mut ctx = Context::new();
//! let result = ctx.eval("let x: number = 2\nlet y: number = 3\nreturn x + y * 4").unwrap();
//! assert_eq!(result.as_number(), 14.0);
//! ```
//!
//! Hosts extend the language through [`Context::register_prelude`],
//! [`Context::register_type`], and native functions built with
//! [`object::make_native`]; see the [`embedding`] module for the helpers
//! natives use to talk to the VM.

pub mod ast;
pub mod compiler;
pub mod context;
pub mod debug;
pub mod embedding;
pub mod gc;
pub mod interpreter;
pub mod object;
pub mod op;
pub mod parser;
#[cfg(feature = "stdlib")]
pub mod stdlib;
pub mod tokenizer;
pub mod types;
pub mod value;

pub use context::{CompilerOptions, Context, ErrorKind, Handlers};
pub use interpreter::{RuntimeError, Thread};
pub use object::{ObjKind, make_native};
pub use op::{Op, OpCode};
pub use tokenizer::{Token, TokenKind, Tokenizer};
pub use types::{TypeCategory, TypeObj};
pub use value::{VALUE_FALSE, VALUE_NULL, VALUE_TRUE, Value};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
