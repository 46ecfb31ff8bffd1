//! File-system storage for the consumer.

pub mod pairing_record;
