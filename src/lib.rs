// Cooperative millisecond task dispatcher for small no_std targets

#![no_std]

pub mod kernel;
