//! Built-in Library
//!
//! Optional batteries registered into a context at startup: the `core`
//! prelude (`print`, `error`, `assert`), and the `arrays`, `strings`,
//! `math`, and `meta` modules. Array and string methods are also attached
//! to their primitive types' prototypes so dot-call sugar resolves them.

mod arrays;
mod core;
mod math;
mod meta;
mod strings;

use crate::context::Context;

pub fn install(ctx: &mut Context) {
    core::install(ctx);
    arrays::install(ctx);
    strings::install(ctx);
    math::install(ctx);
    meta::install(ctx);
}
