//! The OS/2 personality surface: a thin adapter between the classic
//! DOSCALLS thread API and the native scheduler.

pub mod doscalls;
