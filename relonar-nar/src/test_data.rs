//! Canonical archives and wire-building helpers shared by the test
//! suites of this crate and its consumers.

use bytes::Bytes;
use relonar_io::encode_bytes;

use crate::{NarEvent, NAR_MAGIC};

/// An event sequence paired with its exact wire encoding.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub events: Vec<NarEvent>,
    pub wire: Vec<u8>,
}

/// Frame a sequence of tokens.
pub fn wire(tokens: &[&[u8]]) -> Vec<u8> {
    tokens.iter().flat_map(|t| encode_bytes(t)).collect()
}

/// Wire bytes of a regular-file node.
pub fn file_node(contents: &[u8], executable: bool) -> Vec<u8> {
    let mut out = wire(&[b"(", b"type", b"regular"]);
    if executable {
        out.extend(wire(&[b"executable", b""]));
    }
    out.extend(wire(&[b"contents", contents, b")"]));
    out
}

/// Wire bytes of a symlink node.
pub fn symlink_node(target: &[u8]) -> Vec<u8> {
    wire(&[b"(", b"type", b"symlink", b"target", target, b")"])
}

/// Wire bytes of a directory node with pre-encoded child nodes.
pub fn dir_node(entries: &[(&[u8], Vec<u8>)]) -> Vec<u8> {
    let mut out = wire(&[b"(", b"type", b"directory"]);
    for (name, node) in entries {
        out.extend(wire(&[b"entry", b"(", b"name", name, b"node"]));
        out.extend_from_slice(node);
        out.extend(wire(&[b")"]));
    }
    out.extend(wire(&[b")"]));
    out
}

/// A whole archive: magic plus one root node.
pub fn archive(node: Vec<u8>) -> Vec<u8> {
    let mut out = wire(&[NAR_MAGIC]);
    out.extend_from_slice(&node);
    out
}

/// An archive whose root is a directory with the given entries.
pub fn dir_with_entries(entries: &[(&[u8], Vec<u8>)]) -> Vec<u8> {
    archive(dir_node(entries))
}

pub fn text_file() -> Fixture {
    let contents = b"hello world\n";
    Fixture {
        events: vec![NarEvent::File {
            name: Bytes::new(),
            executable: false,
            contents: Bytes::from_static(contents),
        }],
        wire: archive(file_node(contents, false)),
    }
}

pub fn exec_file() -> Fixture {
    let contents = b"#!/bin/sh\necho hi\n";
    Fixture {
        events: vec![NarEvent::File {
            name: Bytes::new(),
            executable: true,
            contents: Bytes::from_static(contents),
        }],
        wire: archive(file_node(contents, true)),
    }
}

pub fn empty_file() -> Fixture {
    Fixture {
        events: vec![NarEvent::File {
            name: Bytes::new(),
            executable: false,
            contents: Bytes::new(),
        }],
        wire: archive(file_node(b"", false)),
    }
}

pub fn symlink() -> Fixture {
    let target = b"/nix/store/abc-glibc/lib/ld.so";
    Fixture {
        events: vec![NarEvent::Symlink {
            name: Bytes::new(),
            target: Bytes::from_static(target),
        }],
        wire: archive(symlink_node(target)),
    }
}

pub fn empty_dir() -> Fixture {
    Fixture {
        events: vec![
            NarEvent::StartDirectory { name: Bytes::new() },
            NarEvent::EndDirectory,
        ],
        wire: dir_with_entries(&[]),
    }
}

/// A small mixed tree: a subdirectory with an executable, a plain file
/// and a symlink, with entries in sorted order.
pub fn dir_example() -> Fixture {
    let script = b"#!/bin/sh\necho hello\n";
    let text = b"some text\n";
    let target = b"/nix/store/abc-foo/share/doc";

    let events = vec![
        NarEvent::StartDirectory { name: Bytes::new() },
        NarEvent::StartDirectory {
            name: Bytes::from_static(b"bin"),
        },
        NarEvent::File {
            name: Bytes::from_static(b"hello"),
            executable: true,
            contents: Bytes::from_static(script),
        },
        NarEvent::EndDirectory,
        NarEvent::File {
            name: Bytes::from_static(b"readme"),
            executable: false,
            contents: Bytes::from_static(text),
        },
        NarEvent::Symlink {
            name: Bytes::from_static(b"share"),
            target: Bytes::from_static(target),
        },
        NarEvent::EndDirectory,
    ];

    let wire = dir_with_entries(&[
        (
            b"bin".as_slice(),
            dir_node(&[(b"hello", file_node(script, true))]),
        ),
        (b"readme", file_node(text, false)),
        (b"share", symlink_node(target)),
    ]);

    Fixture { events, wire }
}

#[cfg(any(test, feature = "arbitrary"))]
pub mod arbitrary {
    //! Proptest generators for arbitrary valid NAR event streams.

    use std::collections::BTreeMap;

    use bytes::Bytes;
    use proptest::prelude::*;

    use crate::NarEvent;

    #[derive(Debug, Clone)]
    enum Node {
        File { executable: bool, contents: Vec<u8> },
        Symlink { target: Vec<u8> },
        Dir(BTreeMap<String, Node>),
    }

    // First character is never a dot, so `.` and `..` cannot occur.
    fn arb_name() -> impl Strategy<Value = String> {
        "[a-z0-9_][a-z0-9_.-]{0,11}"
    }

    fn arb_node(depth: u32, max_size: usize, max_entries: usize) -> impl Strategy<Value = Node> {
        let leaf = prop_oneof![
            (any::<bool>(), prop::collection::vec(any::<u8>(), 0..max_size)).prop_map(
                |(executable, contents)| Node::File {
                    executable,
                    contents,
                }
            ),
            prop::collection::vec(any::<u8>(), 1..64)
                .prop_map(|target| Node::Symlink { target }),
        ];
        leaf.prop_recursive(depth, 64, max_entries as u32, move |inner| {
            prop::collection::btree_map(arb_name(), inner, 0..max_entries).prop_map(Node::Dir)
        })
    }

    fn flatten(name: Bytes, node: Node, out: &mut Vec<NarEvent>) {
        match node {
            Node::File {
                executable,
                contents,
            } => out.push(NarEvent::File {
                name,
                executable,
                contents: contents.into(),
            }),
            Node::Symlink { target } => out.push(NarEvent::Symlink {
                name,
                target: target.into(),
            }),
            Node::Dir(entries) => {
                out.push(NarEvent::StartDirectory { name });
                for (child_name, child) in entries {
                    flatten(Bytes::from(child_name.into_bytes()), child, out);
                }
                out.push(NarEvent::EndDirectory);
            }
        }
    }

    /// An arbitrary valid event stream: a tree up to `depth` deep, files
    /// up to `max_size` bytes, directories up to `max_entries` wide.
    pub fn arb_nar_events(
        depth: u32,
        max_size: usize,
        max_entries: usize,
    ) -> impl Strategy<Value = Vec<NarEvent>> {
        arb_node(depth, max_size, max_entries).prop_map(|node| {
            let mut out = Vec::new();
            flatten(Bytes::new(), node, &mut out);
            out
        })
    }
}
