use std::error::Error;
use std::ops::Add;

use log::warn;
use serde::Serialize;

/// A span of time, stored in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time(u64);

impl Time {
    pub fn from_milliseconds(milliseconds: u64) -> Self {
        Time(milliseconds)
    }

    pub fn from_seconds(seconds: u64) -> Self {
        Time(seconds * 1000)
    }

    /// CLI limits are fractional seconds.
    pub fn from_seconds_f64(seconds: f64) -> Self {
        Time((seconds * 1000.0).round() as u64)
    }
}

impl Time {
    pub fn into_milliseconds(self) -> u64 {
        self.0
    }

    pub fn into_seconds(self) -> u64 {
        self.0 / 1000
    }

    pub fn into_seconds_f64(self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

impl Serialize for Time {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.into_milliseconds())
    }
}

impl Add for Time {
    type Output = Time;

    fn add(self, rhs: Self) -> Self::Output {
        Time(self.0 + rhs.0)
    }
}

/// An amount of memory, stored in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Memory(u64);

impl Memory {
    pub fn from_bytes(bytes: u64) -> Self {
        Memory(bytes)
    }

    pub fn from_kilobytes(kilobytes: u64) -> Self {
        Memory(kilobytes * 1024)
    }

    pub fn from_megabytes(megabytes: u64) -> Self {
        Memory(megabytes * 1024 * 1024)
    }
}

impl Memory {
    pub fn into_bytes(self) -> u64 {
        self.0
    }

    pub fn into_kilobytes(self) -> u64 {
        self.0 / 1024
    }

    pub fn into_megabytes(self) -> u64 {
        self.0 / 1024 / 1024
    }
}

impl Serialize for Memory {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.into_bytes())
    }
}

impl Add for Memory {
    type Output = Memory;

    fn add(self, rhs: Self) -> Self::Output {
        Memory(self.0 + rhs.0)
    }
}

/// Log-and-forget for cleanup paths whose failure must not abort the run.
pub trait Logable {
    fn log(self);
}

impl<T, E> Logable for Result<T, E>
where
    E: Error,
{
    fn log(self) {
        if let Err(e) = self {
            warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_conversions() {
        assert_eq!(Time::from_seconds(2).into_milliseconds(), 2000);
        assert_eq!(Time::from_seconds_f64(1.5).into_milliseconds(), 1500);
        assert_eq!(Time::from_milliseconds(2499).into_seconds(), 2);
    }

    #[test]
    fn memory_conversions() {
        assert_eq!(Memory::from_kilobytes(256).into_bytes(), 256 * 1024);
        assert_eq!(Memory::from_megabytes(32).into_kilobytes(), 32 * 1024);
        assert_eq!(Memory::from_bytes(1024 * 1024).into_megabytes(), 1);
    }

    #[test]
    fn memory_ordering_is_byte_exact() {
        let limit = Memory::from_kilobytes(256);
        assert!(Memory::from_bytes(256 * 1024) <= limit);
        assert!(Memory::from_bytes(256 * 1024 + 1) > limit);
    }
}
