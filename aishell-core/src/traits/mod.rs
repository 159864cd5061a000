//! ABOUTME: Trait seams of the orchestration core
//! ABOUTME: Tool contract, coordination backend, collaborator interfaces, agent dispatch

pub mod backend;
pub mod collaborators;
pub mod dispatch;
pub mod tool;
