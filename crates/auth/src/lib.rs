//! `forgeledger-auth`: authentication/authorization boundary.
//!
//! This crate is decoupled from HTTP and storage: it knows roles, actors,
//! token claims and how to verify an HS256 token, nothing more.

pub mod authorize;
pub mod claims;
pub mod jwt;
pub mod roles;

pub use authorize::{Actor, Authorizer, AuthzError, ClaimedRoles, InMemoryRoleGrants, require_role};
pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtValidator};
pub use roles::Role;
