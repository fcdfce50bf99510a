//! Reads from the stitched XML configuration produced by the external
//! stitcher (SPEC_FULL.md §4.3 step 3).
//!
//! The stitcher's own schema is external to this system (§1: "the core
//! never parses docset/product XML itself" except for the combined output
//! it hands back). The element/attribute names assumed below follow the
//! xpath queries in `original_source/src/docserv/bih.py::read_conf_dir`
//! (`maintainers/contact`, `docset[@setid]/@lifecycle`,
//! `language[@lang]/branch`, `language[@lang]/subdir`,
//! `builddocs/git/@remote`) extended with the attributes SPEC_FULL.md's
//! enumeration additionally requires (`navigation`, `container-image`,
//! per-deliverable `<param>` overrides) that the stitcher's real schema
//! would carry but which aren't spelled out in the distilled spec.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use docbuild_types::{Lifecycle, NavigationMode, OutputFormat};
use roxmltree::{Document, Node};

/// One `<deliverable>` entry enumerated from the stitched config, before
/// it has been expanded into one [`docbuild_types::Deliverable`] per
/// enabled format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDeliverable {
    pub dc_file: String,
    pub formats: Vec<OutputFormat>,
    pub subdeliverables: Vec<String>,
    pub xslt_params: Vec<(String, String)>,
    pub container_image: Option<String>,
}

pub struct StitchedConfig {
    xml: String,
}

impl StitchedConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let xml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read stitched config {}", path.display()))?;
        Self::from_xml(xml)
    }

    pub fn from_xml(xml: impl Into<String>) -> Result<Self> {
        let xml = xml.into();
        Document::parse(&xml)
            .context("failed to parse stitched config XML")?;
        Ok(Self { xml })
    }

    fn doc(&self) -> Document<'_> {
        Document::parse(&self.xml).expect("xml validated at construction")
    }

    fn find_product<'a>(doc: &'a Document<'a>, product: &str) -> Option<Node<'a, 'a>> {
        doc.descendants()
            .find(|n| n.has_tag_name("product") && n.attribute("productid") == Some(product))
    }

    fn find_docset<'a>(doc: &'a Document<'a>, product: &str, docset: &str) -> Option<Node<'a, 'a>> {
        Self::find_product(doc, product)?
            .children()
            .find(|n| n.has_tag_name("docset") && n.attribute("setid") == Some(docset))
    }

    fn find_language<'a>(
        doc: &'a Document<'a>,
        product: &str,
        docset: &str,
        lang: &str,
    ) -> Option<Node<'a, 'a>> {
        Self::find_docset(doc, product, docset)?
            .descendants()
            .find(|n| n.has_tag_name("language") && n.attribute("lang") == Some(lang))
    }

    pub fn docset_exists(&self, product: &str, docset: &str) -> bool {
        let doc = self.doc();
        Self::find_docset(&doc, product, docset).is_some()
    }

    pub fn maintainers(&self, product: &str) -> Vec<String> {
        let doc = self.doc();
        let Some(product_node) = Self::find_product(&doc, product) else {
            return Vec::new();
        };
        product_node
            .descendants()
            .filter(|n| n.has_tag_name("contact"))
            .filter_map(|n| n.text())
            .map(str::to_string)
            .collect()
    }

    pub fn lifecycle(&self, product: &str, docset: &str) -> Option<Lifecycle> {
        let doc = self.doc();
        let node = Self::find_docset(&doc, product, docset)?;
        match node.attribute("lifecycle") {
            Some("supported") | None => Some(Lifecycle::Supported),
            Some("beta") => Some(Lifecycle::Beta),
            Some("unsupported") => Some(Lifecycle::Unsupported),
            Some("unpublished") => Some(Lifecycle::Unpublished),
            Some(_) => None,
        }
    }

    pub fn navigation_mode(&self, product: &str, docset: &str) -> NavigationMode {
        let doc = self.doc();
        match Self::find_docset(&doc, product, docset).and_then(|n| n.attribute("navigation")) {
            Some("hidden") => NavigationMode::Hidden,
            Some("disabled") => NavigationMode::Disabled,
            _ => NavigationMode::Linked,
        }
    }

    pub fn docset_container_image(&self, product: &str, docset: &str) -> Option<String> {
        let doc = self.doc();
        Self::find_docset(&doc, product, docset)?
            .attribute("container-image")
            .map(str::to_string)
    }

    pub fn branch(&self, product: &str, docset: &str, lang: &str) -> Option<String> {
        let doc = self.doc();
        Self::find_language(&doc, product, docset, lang)?
            .children()
            .find(|n| n.has_tag_name("branch"))?
            .text()
            .map(str::to_string)
    }

    pub fn subdir(&self, product: &str, docset: &str, lang: &str) -> Option<String> {
        let doc = self.doc();
        Self::find_language(&doc, product, docset, lang)?
            .children()
            .find(|n| n.has_tag_name("subdir"))?
            .text()
            .map(str::to_string)
    }

    pub fn remote(&self, product: &str, docset: &str) -> Option<String> {
        let doc = self.doc();
        Self::find_docset(&doc, product, docset)?
            .descendants()
            .find(|n| n.has_tag_name("git"))?
            .attribute("remote")
            .map(str::to_string)
    }

    /// All `<deliverable>` entries under the given language, as raw
    /// (pre-format-expansion) records (§4.3 "deliverable enumeration").
    pub fn deliverables(&self, product: &str, docset: &str, lang: &str) -> Vec<RawDeliverable> {
        let doc = self.doc();
        let Some(lang_node) = Self::find_language(&doc, product, docset, lang) else {
            return Vec::new();
        };

        lang_node
            .children()
            .filter(|n| n.has_tag_name("deliverable"))
            .filter_map(|node| parse_deliverable(node))
            .collect()
    }
}

fn parse_deliverable(node: Node) -> Option<RawDeliverable> {
    let dc_file = node
        .children()
        .find(|n| n.has_tag_name("dc"))?
        .text()?
        .to_string();

    let mut formats = Vec::new();
    if let Some(format_node) = node.children().find(|n| n.has_tag_name("format")) {
        for fmt in OutputFormat::ALL {
            if let Some(value) = format_node.attribute(fmt.as_str())
                && value != "false"
                && value != "0"
            {
                formats.push(fmt);
            }
        }
    }

    let subdeliverables = node
        .children()
        .filter(|n| n.has_tag_name("subdeliverable"))
        .filter_map(|n| n.text())
        .map(str::to_string)
        .collect();

    let xslt_params = node
        .children()
        .filter(|n| n.has_tag_name("param"))
        .filter_map(|n| {
            let name = n.attribute("name")?.to_string();
            let value = n.text().unwrap_or_default().to_string();
            Some((name, value))
        })
        .collect();

    let container_image = node.attribute("container-image").map(str::to_string);

    Some(RawDeliverable {
        dc_file,
        formats,
        subdeliverables,
        xslt_params,
        container_image,
    })
}

pub fn xslt_params_map(params: &[(String, String)]) -> HashMap<String, String> {
    params.iter().cloned().collect()
}
