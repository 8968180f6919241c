use super::*;
use crate::message::{new_id, Message};
use crate::storage::{keys, MemoryCluster, MemoryStore, WriteBatchOp};
use std::time::Duration;

mod common;
use common::*;

mod consume;
mod recovery;
