//! Structured symmetric positive (semi-)definite operators.
//!
//! An [`Spd`] holds one of four internal structures (dense, diagonal,
//! uniform diagonal, low rank) and exposes the linear algebra needed by
//! Gaussian computations (Cholesky factor, symmetric root, log-determinant,
//! Mahalanobis distances, quadratic forms) using the cheapest formula the
//! structure allows.
//!
//! Arithmetic between operators follows a closure table: the result keeps the
//! most specific structure, e.g. diagonal + diagonal stays diagonal while
//! diagonal + dense becomes dense. Adding a scalar always gives a dense
//! operator since every entry is shifted.
//!
//! Low-rank operators whose rank is below their size are singular: every
//! operation requiring an inverse fails with [`SpdError::Singular`] instead of
//! silently regularizing. Use [`Spd::densify`] then [`Spd::regularize`] to opt in.
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod arithmetic;
mod errors;
mod spd;

pub use errors::*;
pub use spd::*;
