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

//! Small alignment helpers shared by the heap and the backing device.

/// Round `v` up to a multiple of `align`. `align` must be a power of two.
pub(crate) fn align_up(align: usize, v: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}

/// Round `v` down to a multiple of `align`. `align` must be a power of two.
pub(crate) fn align_down(align: usize, v: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    v & !(align - 1)
}

/// Round `v` up to a multiple of `unit`. `unit` may be any non-zero value,
/// which is why this is not expressed with bit masks.
pub(crate) fn round_up(unit: usize, v: usize) -> usize {
    debug_assert!(unit > 0);
    v.div_ceil(unit) * unit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align_up(4096, 1), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4096, 4097), 8192);
        assert_eq!(align_down(4096, 4097), 4096);
        assert_eq!(align_down(4096, 4095), 0);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(256, 0), 0);
        assert_eq!(round_up(256, 1), 256);
        assert_eq!(round_up(256, 256), 256);
        assert_eq!(round_up(300, 301), 600);
    }
}
