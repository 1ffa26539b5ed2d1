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

//! Critbit-nibble tree: a radix tree discriminating on 4-bit slices of the
//! key, giving a 16-way branch per interior node.
//!
//! Keys are discriminated in framed form: the 8-byte little-endian key
//! length followed by the key bytes. Keys of different lengths therefore
//! diverge within the first eight framed bytes, so one key being a prefix of
//! another is not a conflict; only an exact duplicate is.
//!
//! Nibble discrimination is necessary but not sufficient: a lookup that
//! reaches a leaf still compares the whole key.

use std::ptr::NonNull;

use crate::{
    entry::CacheEntry,
    error::{Error, Result},
};

const SLICE: u32 = 4;
const SLNODES: usize = 1 << SLICE;

fn slice_index(b: u8, shift: u8) -> usize {
    ((b >> shift) & (SLNODES as u8 - 1)) as usize
}

/// A key as the tree sees it: length prefix plus raw bytes.
pub(crate) struct FramedKey<'a> {
    len: [u8; 8],
    key: &'a [u8],
}

impl<'a> FramedKey<'a> {
    pub(crate) fn new(key: &'a [u8]) -> Self {
        Self {
            len: (key.len() as u64).to_le_bytes(),
            key,
        }
    }

    fn len(&self) -> usize {
        self.len.len() + self.key.len()
    }

    fn byte(&self, i: usize) -> u8 {
        if i < self.len.len() {
            self.len[i]
        } else {
            self.key[i - self.len.len()]
        }
    }
}

enum Child {
    Empty,
    Node(Box<Node>),
    Leaf(NonNull<CacheEntry>),
}

impl Default for Child {
    fn default() -> Self {
        Self::Empty
    }
}

struct Node {
    children: [Child; SLNODES],
    /// Framed-key byte index this node discriminates at.
    byte: u32,
    /// Bit shift of the discriminating nibble within that byte (0 or 4).
    shift: u8,
}

impl Node {
    fn new(byte: u32, shift: u8) -> Self {
        Self {
            children: std::array::from_fn(|_| Child::Empty),
            byte,
            shift,
        }
    }
}

#[derive(Default)]
pub(crate) struct Critnib {
    root: Child,
}

// SAFETY: leaves are plain pointers to entries kept alive by the indexed
// reference; all mutation happens under the owning shard's write lock.
unsafe impl Send for Critnib {}
unsafe impl Sync for Critnib {}

impl Critnib {
    /// Exact-match lookup. The refcount is untouched; the caller acquires
    /// under the same shard lock.
    pub(crate) fn get(&self, key: &FramedKey<'_>) -> Option<NonNull<CacheEntry>> {
        let mut n = &self.root;
        loop {
            match n {
                Child::Empty => return None,
                Child::Leaf(ptr) => {
                    // SAFETY: leaves reference live indexed entries.
                    let entry = unsafe { ptr.as_ref() };
                    return (key.key == entry.key()).then_some(*ptr);
                }
                Child::Node(node) => {
                    if node.byte as usize >= key.len() {
                        return None;
                    }
                    n = &node.children[slice_index(key.byte(node.byte as usize), node.shift)];
                }
            }
        }
    }

    pub(crate) fn insert(&mut self, entry: NonNull<CacheEntry>) -> Result<()> {
        // SAFETY: the entry is alive and unpublished; we only read its key.
        let key = FramedKey::new(unsafe { entry.as_ref() }.key());

        if matches!(self.root, Child::Empty) {
            self.root = Child::Leaf(entry);
            return Ok(());
        }

        // First descent: find a leaf of the subtree sharing the longest
        // discriminated prefix with the new key.
        let mut n = &self.root;
        loop {
            match n {
                Child::Node(node) if (node.byte as usize) < key.len() => {
                    let c = &node.children[slice_index(key.byte(node.byte as usize), node.shift)];
                    if matches!(c, Child::Empty) {
                        break;
                    }
                    n = c;
                }
                _ => break,
            }
        }
        let incumbent = match n {
            Child::Leaf(p) => *p,
            _ => any_leaf(n).expect("non-empty subtree without a leaf"),
        };

        // SAFETY: as above.
        let inc_key = FramedKey::new(unsafe { incumbent.as_ref() }.key());

        // Divergence point, accurate to a byte.
        let common = key.len().min(inc_key.len());
        let mut diff = 0;
        while diff < common && key.byte(diff) == inc_key.byte(diff) {
            diff += 1;
        }
        if diff == common {
            // The length framing makes unequal-length keys diverge within
            // the first eight bytes, so this is an exact duplicate.
            return Err(Error::AlreadyExists);
        }

        // Divergence point within the byte, rounded down to a nibble.
        let at = key.byte(diff) ^ inc_key.byte(diff);
        let sh = (7 - at.leading_zeros() as u8) & !(SLICE as u8 - 1);

        // Second descent, to where the divergence lands.
        let mut slot = &mut self.root;
        loop {
            let cur = slot;
            let descend = matches!(
                cur,
                Child::Node(node)
                    if (node.byte as usize) < diff
                        || (node.byte as usize == diff && node.shift >= sh)
            );
            if descend {
                match cur {
                    Child::Node(node) => {
                        let idx = slice_index(key.byte(node.byte as usize), node.shift);
                        slot = &mut node.children[idx];
                    }
                    _ => unreachable!(),
                }
            } else {
                slot = cur;
                break;
            }
        }

        match slot {
            Child::Empty => {
                // An existing node already dispatches at this nibble and the
                // slice is free.
                *slot = Child::Leaf(entry);
            }
            _ => {
                // Split the edge with a new interior node routing the
                // incumbent subtree and the new leaf to distinct slices.
                let mut node = Box::new(Node::new(diff as u32, sh));
                node.children[slice_index(inc_key.byte(diff), sh)] =
                    std::mem::replace(slot, Child::Empty);
                node.children[slice_index(key.byte(diff), sh)] = Child::Leaf(entry);
                *slot = Child::Node(node);
            }
        }
        Ok(())
    }

    /// Detach the leaf with the given key. Refcounts are untouched.
    pub(crate) fn remove(&mut self, key: &FramedKey<'_>) -> Option<NonNull<CacheEntry>> {
        let mut pp: *mut Child = std::ptr::null_mut();
        let mut parent: *mut Child = &mut self.root;

        // SAFETY: raw cursors into a tree we have exclusive access to; the
        // grandparent slot is needed after the leaf slot is rewritten, which
        // a borrow-tracked walk cannot express.
        unsafe {
            loop {
                match &mut *parent {
                    Child::Empty => return None,
                    Child::Leaf(_) => break,
                    Child::Node(node) => {
                        if node.byte as usize >= key.len() {
                            return None;
                        }
                        let idx = slice_index(key.byte(node.byte as usize), node.shift);
                        pp = parent;
                        parent = &mut node.children[idx];
                    }
                }
            }

            let ptr = match &*parent {
                Child::Leaf(p) => *p,
                _ => unreachable!(),
            };
            if key.key != ptr.as_ref().key() {
                return None;
            }
            *parent = Child::Empty;

            if pp.is_null() {
                return Some(ptr);
            }

            // Splice out the parent if the removal left it with one child.
            let node = match &mut *pp {
                Child::Node(node) => node,
                _ => unreachable!(),
            };
            let mut only = None;
            for (i, c) in node.children.iter().enumerate() {
                if !matches!(c, Child::Empty) {
                    if only.is_some() {
                        return Some(ptr);
                    }
                    only = Some(i);
                }
            }
            let i = only.expect("interior node left without children");
            let child = std::mem::replace(&mut node.children[i], Child::Empty);
            *pp = child;
            Some(ptr)
        }
    }

    /// Tear the tree down, handing every leaf to `f`.
    pub(crate) fn drain(&mut self, f: &mut dyn FnMut(NonNull<CacheEntry>)) {
        fn walk(child: Child, f: &mut dyn FnMut(NonNull<CacheEntry>)) {
            match child {
                Child::Empty => {}
                Child::Leaf(p) => f(p),
                Child::Node(node) => {
                    let Node { children, .. } = *node;
                    for c in children {
                        walk(c, f);
                    }
                }
            }
        }
        walk(std::mem::replace(&mut self.root, Child::Empty), f);
    }
}

fn any_leaf(child: &Child) -> Option<NonNull<CacheEntry>> {
    match child {
        Child::Empty => None,
        Child::Leaf(p) => Some(*p),
        Child::Node(node) => node.children.iter().find_map(any_leaf),
    }
}
