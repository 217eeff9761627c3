//! Derive index documents from doc content.
//!
//! Root doc layout: `meta.pages` is a list of `{ id, title }`.
//! Page doc layout: `blocks` maps block id to a map carrying `sys:flavour`,
//! `sys:children` (list of block ids) and `prop:text` / `prop:title`.

use crate::crdt;
use crate::error::Result;
use crate::storage::IndexDocument;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

const PAGE_FLAVOUR: &str = "affine:page";
const SUMMARY_LIMIT: usize = 1000;

#[derive(Debug, Default)]
pub struct RootCrawl {
    /// One `doc` table entry per listed page
    pub docs: Vec<IndexDocument>,
    /// Previously indexed ids no longer listed
    pub deleted: Vec<String>,
}

pub fn crawl_root(root_bin: &[u8], indexed: &[String]) -> Result<RootCrawl> {
    let json = crdt::to_json(root_bin)?;
    let pages = json
        .pointer("/meta/pages")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut listed = BTreeSet::new();
    let mut docs = Vec::new();
    for page in pages {
        let Some(id) = page.get("id").and_then(Value::as_str) else {
            continue;
        };
        if !listed.insert(id.to_string()) {
            continue;
        }
        let title = page.get("title").and_then(Value::as_str).unwrap_or_default();
        docs.push(IndexDocument::new(id).with("docId", id).with("title", title));
    }

    let deleted = indexed
        .iter()
        .filter(|id| !listed.contains(*id))
        .cloned()
        .collect();
    Ok(RootCrawl { docs, deleted })
}

#[derive(Debug, Default)]
pub struct DocCrawl {
    pub preview: Option<IndexDocument>,
    pub blocks: Vec<IndexDocument>,
}

fn text_of(block: &Value) -> Option<&str> {
    block
        .get("prop:text")
        .or_else(|| block.get("prop:title"))
        .and_then(Value::as_str)
}

pub fn crawl_doc(doc_id: &str, bin: &[u8]) -> Result<DocCrawl> {
    let json = crdt::to_json(bin)?;
    let Some(blocks) = json.get("blocks").and_then(Value::as_object) else {
        return Ok(DocCrawl::default());
    };

    let mut parents: HashMap<&str, &str> = HashMap::new();
    for (id, block) in blocks {
        for child in block
            .get("sys:children")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
        {
            parents.insert(child, id.as_str());
        }
    }

    // Walk from the page block so previews read in document order.
    let root = blocks
        .iter()
        .find(|(_, b)| b.get("sys:flavour").and_then(Value::as_str) == Some(PAGE_FLAVOUR))
        .map(|(id, _)| id.as_str());
    let mut order: Vec<&str> = Vec::with_capacity(blocks.len());
    let mut stack: Vec<&str> = root.into_iter().collect();
    let mut seen = BTreeSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        order.push(id);
        if let Some(children) = blocks.get(id).and_then(|b| b.get("sys:children")).and_then(Value::as_array) {
            stack.extend(children.iter().rev().filter_map(Value::as_str));
        }
    }
    // Orphans last, in key order.
    let mut orphans: Vec<&str> = blocks.keys().map(String::as_str).filter(|id| !seen.contains(id)).collect();
    orphans.sort();
    order.extend(orphans);

    let mut title = String::new();
    let mut summary = String::new();
    let mut documents = Vec::new();
    for id in order {
        let Some(block) = blocks.get(id) else {
            continue;
        };
        let flavour = block
            .get("sys:flavour")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let content = text_of(block).unwrap_or_default();

        if flavour == PAGE_FLAVOUR {
            title = content.to_string();
        } else if !content.is_empty() && summary.chars().count() < SUMMARY_LIMIT {
            if !summary.is_empty() {
                summary.push(' ');
            }
            summary.extend(content.chars().take(SUMMARY_LIMIT - summary.chars().count()));
        }

        let mut document = IndexDocument::new(format!("{doc_id}:{id}"))
            .with("docId", doc_id)
            .with("blockId", id)
            .with("flavour", flavour);
        if !content.is_empty() {
            document.insert("content", content);
        }
        if let Some(parent) = parents.get(id) {
            document.insert("parentBlockId", *parent);
            if let Some(parent_flavour) = blocks
                .get(*parent)
                .and_then(|b| b.get("sys:flavour"))
                .and_then(Value::as_str)
            {
                document.insert("parentFlavour", parent_flavour);
            }
        }
        documents.push(document);
    }

    let preview = IndexDocument::new(doc_id)
        .with("docId", doc_id)
        .with("title", title)
        .with("summary", summary);
    Ok(DocCrawl {
        preview: Some(preview),
        blocks: documents,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use loro::{Container, ExportMode, LoroDoc, LoroList, LoroMap, ValueOrContainer};

    fn export(doc: &LoroDoc) -> Vec<u8> {
        doc.commit();
        doc.export(ExportMode::all_updates()).unwrap()
    }

    /// Root doc listing `(id, title)` pages.
    pub fn root_doc(pages: &[(&str, &str)]) -> Vec<u8> {
        let doc = LoroDoc::new();
        let list = doc.get_map("meta").insert_container("pages", LoroList::new()).unwrap();
        for (index, (id, title)) in pages.iter().enumerate() {
            let page = list.insert_container(index, LoroMap::new()).unwrap();
            page.insert("id", *id).unwrap();
            page.insert("title", *title).unwrap();
        }
        export(&doc)
    }

    /// Update to `bin` that changes the page title.
    pub fn retitle(bin: &[u8], title: &str) -> Vec<u8> {
        let doc = crate::crdt::load(bin).unwrap();
        let Some(ValueOrContainer::Container(Container::Map(page))) =
            doc.get_map("blocks").get("page")
        else {
            panic!("no page block to retitle");
        };
        page.insert("prop:title", title).unwrap();
        export(&doc)
    }

    /// Page doc with a title and the given paragraphs.
    pub fn page_doc(title: &str, paragraphs: &[&str]) -> Vec<u8> {
        let doc = LoroDoc::new();
        let blocks = doc.get_map("blocks");

        let page = blocks.insert_container("page", LoroMap::new()).unwrap();
        page.insert("sys:flavour", "affine:page").unwrap();
        page.insert("prop:title", title).unwrap();
        let children = page.insert_container("sys:children", LoroList::new()).unwrap();

        for (index, text) in paragraphs.iter().enumerate() {
            let id = format!("p{index}");
            children.insert(index, id.as_str()).unwrap();
            let block = blocks.insert_container(&id, LoroMap::new()).unwrap();
            block.insert("sys:flavour", "affine:paragraph").unwrap();
            block.insert("prop:text", *text).unwrap();
        }
        export(&doc)
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_root_crawl_reports_removed_pages() {
        let bin = root_doc(&[("a", "Alpha"), ("c", "Gamma")]);
        let indexed = vec!["a".to_string(), "b".to_string()];

        let crawl = crawl_root(&bin, &indexed).unwrap();
        let ids: Vec<&str> = crawl.docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["a", "c"]);
        assert_eq!(crawl.docs[0].first("title"), Some("Alpha"));
        assert_eq!(crawl.deleted, ["b"]);
    }

    #[test]
    fn test_root_without_listing_deletes_everything() {
        let bin = crate::crdt::testing::text_update(1, "not a root doc");
        let crawl = crawl_root(&bin, &["a".to_string()]).unwrap();
        assert!(crawl.docs.is_empty());
        assert_eq!(crawl.deleted, ["a"]);
    }

    #[test]
    fn test_doc_crawl_builds_preview_and_blocks() {
        let bin = page_doc("Notes", &["first line", "second line"]);
        let crawl = crawl_doc("d1", &bin).unwrap();

        let preview = crawl.preview.unwrap();
        assert_eq!(preview.first("title"), Some("Notes"));
        assert_eq!(preview.first("summary"), Some("first line second line"));

        assert_eq!(crawl.blocks.len(), 3);
        let paragraph = crawl.blocks.iter().find(|b| b.id == "d1:p1").unwrap();
        assert_eq!(paragraph.first("content"), Some("second line"));
        assert_eq!(paragraph.first("parentBlockId"), Some("page"));
        assert_eq!(paragraph.first("parentFlavour"), Some("affine:page"));
    }
}
