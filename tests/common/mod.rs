pub mod synthetic_sequence;
