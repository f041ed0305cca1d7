//! Newick and Nexus parsing.
//!
//! The Newick reader is a single left-to-right byte scan over a stack of
//! open-parenthesis markers. Nodes are appended in the order they close, so
//! the root is always the last node.

use crate::error::{EngineError, EngineResult};
use crate::tree::{ParseFlags, ParsedTree, TreeNode};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use taxonium_protocol::MetaValue;

lazy_static! {
    static ref COMMENT_PAIR: Regex = compile(r"(&?\w+)=(\{[^}]*\}|[^,\]]*)");
    static ref TRANSLATE_BLOCK: Regex = compile(r"(?is)\btranslate\b(.*?);");
    static ref TREE_STATEMENT: Regex =
        compile(r"(?is)\btree\s+[^=;]*=\s*(?:\[[^\]]*\]\s*)*(\(.*?;)");
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid pattern {pattern}: {e}"))
}

fn is_number_byte(b: u8) -> bool {
    b.is_ascii_digit() || matches!(b, b'e' | b'E' | b'+' | b'-' | b'.')
}

/// Reads one node label starting at `start` and returns the node together
/// with the index of the first byte that does not belong to it.
fn read_node(text: &str, start: usize, flags: &mut ParseFlags) -> (TreeNode, usize) {
    let bytes = text.as_bytes();
    let mut node = TreeNode::default();
    let mut end: Option<usize> = None;
    let mut i = start;
    while i < bytes.len() && !matches!(bytes[i], b',' | b')' | b';') {
        match bytes[i] {
            b'\'' if end.is_none() => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'\'' {
                    i += 1;
                }
            }
            b'[' => {
                let comment_start = i;
                end.get_or_insert(i);
                while i < bytes.len() && bytes[i] != b']' {
                    i += 1;
                }
                if i == bytes.len() {
                    flags.set(ParseFlags::UNPAIRED_BRACKET);
                    break;
                }
                node.comment = Some(text[comment_start..=i].to_string());
            }
            b':' => {
                end.get_or_insert(i);
                let number_start = i + 1;
                i += 1;
                while i < bytes.len() && is_number_byte(bytes[i]) {
                    i += 1;
                }
                node.branch_length = text[number_start..i]
                    .parse::<f64>()
                    .ok()
                    .filter(|d| *d >= 0.0);
                continue;
            }
            b if b.is_ascii_whitespace() => {
                end.get_or_insert(i);
            }
            _ => {}
        }
        i += 1;
    }
    let end = end.unwrap_or(i.min(bytes.len()));
    if end > start {
        node.name = text[start..end].replace(['\'', '"'], "");
    }
    (node, i)
}

/// Parses `[&key=value,...]` comment content into `meta_key` attributes.
/// Values may be braced lists containing commas.
pub fn parse_comment_metadata(comment: &str) -> Vec<(String, MetaValue)> {
    let inner = comment
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']');
    COMMENT_PAIR
        .captures_iter(inner)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().trim_start_matches('&');
            let value = caps.get(2).map_or("", |m| m.as_str());
            Some((format!("meta_{key}"), MetaValue::Text(value.to_string())))
        })
        .collect()
}

fn strip_preamble(text: &str) -> String {
    let trimmed = text.trim_start();
    let body = match trimmed.strip_prefix('[') {
        Some(rest) => rest.find(']').map_or(rest, |idx| &rest[idx + 1..]),
        None => trimmed,
    };
    body.replace(['\n', '\r'], "")
}

pub fn parse_newick(text: &str) -> EngineResult<ParsedTree> {
    let text = strip_preamble(text);
    let bytes = text.as_bytes();
    let mut flags = ParseFlags::default();
    let mut nodes: Vec<TreeNode> = Vec::new();
    let mut stack: Vec<Option<usize>> = Vec::new();
    let mut n_tips = 0usize;
    let mut l = 0usize;

    while l < bytes.len() {
        while l < bytes.len() && bytes[l].is_ascii_whitespace() {
            l += 1;
        }
        if l == bytes.len() {
            break;
        }
        match bytes[l] {
            b',' => l += 1,
            b';' => break,
            b'(' => {
                stack.push(None);
                l += 1;
            }
            b')' => {
                let Some(marker) = stack.iter().rposition(Option::is_none) else {
                    flags.set(ParseFlags::MISSING_LEFT);
                    break;
                };
                let id = nodes.len();
                let (node, next) = read_node(&text, l + 1, &mut flags);
                nodes.push(node);
                let children: Vec<usize> = stack[marker + 1..].iter().flatten().copied().collect();
                for child in &children {
                    nodes[*child].parent = Some(id);
                }
                nodes[id].children = children;
                stack.truncate(marker);
                stack.push(Some(id));
                l = next;
            }
            _ => {
                n_tips += 1;
                stack.push(Some(nodes.len()));
                let (node, next) = read_node(&text, l, &mut flags);
                nodes.push(node);
                l = next;
            }
        }
    }
    if nodes.is_empty() {
        return Err(EngineError::invalid("Newick input contains no nodes"));
    }
    if stack.len() > 1 {
        // Close every group left open under a synthetic root.
        flags.set(ParseFlags::MISSING_RIGHT);
        let root = nodes.len();
        let children: Vec<usize> = stack.iter().flatten().copied().collect();
        for child in &children {
            nodes[*child].parent = Some(root);
        }
        nodes.push(TreeNode {
            children,
            ..Default::default()
        });
    }
    if !flags.is_clean() {
        log::warn!("Newick parse finished with error flags {:#x}", flags.0);
    }

    let root = nodes.len() - 1;
    for node in nodes.iter_mut() {
        if let Some(comment) = node.comment.as_deref() {
            let pairs = parse_comment_metadata(comment);
            node.metadata.extend(pairs);
        }
    }
    log::debug!("Parsed Newick with {} nodes and {n_tips} tips", nodes.len());

    Ok(ParsedTree {
        nodes,
        root,
        n_tips,
        flags,
        ..Default::default()
    })
}

fn translation_table(nexus: &str) -> HashMap<String, String> {
    let mut table = HashMap::new();
    if let Some(caps) = TRANSLATE_BLOCK.captures(nexus) {
        let block = caps.get(1).map_or("", |m| m.as_str());
        for entry in block.split(',') {
            let mut parts = entry.split_whitespace();
            if let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) {
                table.insert(key.to_string(), value.trim_matches('\'').to_string());
            }
        }
    }
    table
}

/// Extracts the first tree statement from a Nexus document and applies its
/// `Translate` table to the taxon labels. Branch lengths and bracketed
/// comments are left untouched.
pub fn nexus_to_newick(nexus: &str) -> EngineResult<String> {
    let newick = TREE_STATEMENT
        .captures(nexus)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| EngineError::invalid("No tree statement found in Nexus input"))?;
    let table = translation_table(nexus);
    if table.is_empty() {
        return Ok(newick.to_string());
    }

    let mut out = String::with_capacity(newick.len());
    let mut token = String::new();
    let mut after_colon = false;
    let mut in_comment = false;
    let flush = |token: &mut String, out: &mut String, after_colon: bool| {
        if token.is_empty() {
            return;
        }
        let key = token.trim();
        match table.get(key) {
            Some(name) if !after_colon => out.push_str(&token.replace(key, name)),
            _ => out.push_str(token),
        }
        token.clear();
    };
    for c in newick.chars() {
        if in_comment {
            out.push(c);
            in_comment = c != ']';
            continue;
        }
        match c {
            '(' | ')' | ',' | ':' | ';' | '[' => {
                flush(&mut token, &mut out, after_colon);
                after_colon = c == ':';
                in_comment = c == '[';
                out.push(c);
            }
            _ => token.push(c),
        }
    }
    flush(&mut token, &mut out, after_colon);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(tree: &ParsedTree) -> Vec<&str> {
        tree.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    #[test]
    fn test_four_leaf_tree() {
        let tree = parse_newick("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);").unwrap();
        assert_eq!(tree.n_tips, 4);
        assert_eq!(tree.len(), 7);
        assert!(tree.flags.is_clean());
        assert_eq!(names(&tree), vec!["A", "B", "", "C", "D", "", ""]);
        assert_eq!(tree.root, 6);
        assert_eq!(tree.nodes[1].branch_length, Some(0.2));
        assert_eq!(tree.nodes[5].branch_length, Some(0.6));
        assert_eq!(tree.nodes[6].branch_length, None);
        let leaves = tree.nodes.iter().filter(|n| n.is_leaf()).count();
        assert_eq!(leaves, tree.n_tips);
        for (i, node) in tree.nodes.iter().enumerate() {
            if i != tree.root {
                assert!(node.parent.unwrap() < tree.len());
            }
        }
    }

    #[test]
    fn test_comment_metadata_and_quotes() {
        let tree =
            parse_newick("('Sample one'[&country=UK,mutations={T694A:1.0,C29870A:1.0}]:1,B:2)Root;")
                .unwrap();
        let first = &tree.nodes[0];
        assert_eq!(first.name, "Sample one");
        assert_eq!(first.branch_length, Some(1.0));
        assert_eq!(first.metadata.get("meta_country"), Some(&MetaValue::from("UK")));
        assert_eq!(
            first.metadata.get("meta_mutations"),
            Some(&MetaValue::from("{T694A:1.0,C29870A:1.0}"))
        );
        assert_eq!(tree.nodes[tree.root].name, "Root");
    }

    #[test]
    fn test_leading_comment_and_line_breaks() {
        let tree = parse_newick("[title]\n(A:1,\r\n(B:1,C:1):2);\n").unwrap();
        assert_eq!(tree.n_tips, 3);
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn test_unbalanced_parentheses_set_flags() {
        let missing_right = parse_newick("((A,B),C;").unwrap();
        assert!(missing_right.flags.contains(ParseFlags::MISSING_RIGHT));
        let root = missing_right.root;
        for (i, node) in missing_right.nodes.iter().enumerate() {
            if i != root {
                assert!(node.parent.is_some());
            }
        }

        let missing_left = parse_newick("(A,B));").unwrap();
        assert!(missing_left.flags.contains(ParseFlags::MISSING_LEFT));

        let unpaired = parse_newick("(A[&x=1,B);").unwrap();
        assert!(unpaired.flags.contains(ParseFlags::UNPAIRED_BRACKET));
    }

    #[test]
    fn test_empty_input_is_error() {
        assert!(parse_newick("   ;").is_err());
    }

    #[test]
    fn test_nexus_translate() {
        let nexus = "#NEXUS\nBegin trees;\n  Translate\n    1 Alpha,\n    2 Beta,\n    3 Gamma\n  ;\n  tree one = [&R] ((1:1,2:0.5):1,3:2);\nEnd;\n";
        let newick = nexus_to_newick(nexus).unwrap();
        assert_eq!(newick, "((Alpha:1,Beta:0.5):1,Gamma:2);");
        let tree = parse_newick(&newick).unwrap();
        assert_eq!(tree.nodes[0].name, "Alpha");
    }

    #[test]
    fn test_nexus_without_tree_is_error() {
        assert!(nexus_to_newick("#NEXUS\nBegin taxa;\nEnd;").is_err());
    }
}
