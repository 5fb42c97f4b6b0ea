pub mod deltas;
pub mod services;
pub mod stats;

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;
