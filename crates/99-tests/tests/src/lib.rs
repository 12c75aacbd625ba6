//! Cross-crate tests for fusion and voodoo.

#[cfg(test)]
mod support;

#[cfg(test)]
mod calls;

#[cfg(test)]
mod requests;

#[cfg(test)]
mod reactions;

#[cfg(test)]
mod lifetimes;
