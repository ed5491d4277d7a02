//! Boundary to the caller's signature-compatibility check.
//!
//! Whether two managed methods can stand in for each other is decided outside
//! this crate (it needs reflection over the managed signatures). The redirector
//! only asks and refuses on a "no".

use crate::redirector::Function;

pub trait SignatureCheck {
    /// `Err` carries a human-readable reason the pair is incompatible.
    fn check(&self, original: Function, replacement: Function) -> Result<(), String>;
}

impl<F> SignatureCheck for F
where
    F: Fn(Function, Function) -> Result<(), String>,
{
    fn check(&self, original: Function, replacement: Function) -> Result<(), String> {
        self(original, replacement)
    }
}
