//! # Instruct Goose
//!
//! Reinforcement learning from human feedback for small causal language
//! models, built on the Burn ML framework. A policy LM with a value head is
//! fine-tuned with PPO against a reward model while a KL penalty keeps it
//! close to a frozen SFT reference.
//!
//! ## Modules
//!
//! - [`ai`] — Agent, networks, generation, RLHF objective and PPO loss
//! - [`training`] — GAE, `LitAgent` training step, trainer loop, metrics
//! - [`data`] — Byte tokenizer and JSONL prompt dataset
//! - [`checkpoint`] — Model persistence and versioning
//! - [`config`] — TOML configuration loading and validation
//! - [`error`] — Structured error types

#![recursion_limit = "256"]

pub mod ai;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod training;
