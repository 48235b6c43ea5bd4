//! Benchmark crate for the weft thread runtime; see `benches/`.

#![forbid(unsafe_code)]
