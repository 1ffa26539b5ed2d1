//  Copyright 2025 Daxcache Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Assertions for internal invariants: refcount lifecycle, free-list
//! integrity, policy bookkeeping. They are `debug_assert!`s by default and
//! become hard `assert!`s with the `strict_assertions` feature, so stress
//! builds can keep them on in optimized runs without taxing release
//! binaries.

/// `assert!` with `strict_assertions`, `debug_assert!` otherwise.
#[macro_export]
macro_rules! strict_assert {
    ($($arg:tt)*) => {{
        #[cfg(feature = "strict_assertions")]
        assert!($($arg)*);
        #[cfg(not(feature = "strict_assertions"))]
        debug_assert!($($arg)*);
    }};
}

/// `assert_eq!` with `strict_assertions`, `debug_assert_eq!` otherwise.
#[macro_export]
macro_rules! strict_assert_eq {
    ($($arg:tt)*) => {{
        #[cfg(feature = "strict_assertions")]
        assert_eq!($($arg)*);
        #[cfg(not(feature = "strict_assertions"))]
        debug_assert_eq!($($arg)*);
    }};
}

/// `assert_ne!` with `strict_assertions`, `debug_assert_ne!` otherwise.
#[macro_export]
macro_rules! strict_assert_ne {
    ($($arg:tt)*) => {{
        #[cfg(feature = "strict_assertions")]
        assert_ne!($($arg)*);
        #[cfg(not(feature = "strict_assertions"))]
        debug_assert_ne!($($arg)*);
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_passing_assertions() {
        strict_assert!(1 + 1 == 2);
        strict_assert_eq!(1 + 1, 2);
        strict_assert_ne!(1 + 1, 3);
    }

    #[test]
    #[should_panic]
    fn test_failing_assertion() {
        // Test profiles carry debug assertions, so this fires with the
        // feature on or off.
        strict_assert!(1 + 1 == 3);
    }
}
