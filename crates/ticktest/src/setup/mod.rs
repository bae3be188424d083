mod each;
mod registrar;

pub use registrar::{EachTestBuilder, Registrar, TestBuilder};
