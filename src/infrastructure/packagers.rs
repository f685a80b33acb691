use crate::core::bundle::{PackagedAsset, PackagedBundle};
use crate::core::interfaces::{FileSystemService, Packager};
use crate::utils::{Logger, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Writes member outputs one after another, in membership order
pub struct ConcatPackager {
    fs: Arc<dyn FileSystemService>,
}

impl ConcatPackager {
    pub fn new(fs: Arc<dyn FileSystemService>) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Packager for ConcatPackager {
    async fn package(&self, bundle: &PackagedBundle) -> Result<()> {
        let contents: Vec<&str> = bundle.assets.iter().map(|a| a.content.as_str()).collect();
        self.fs.write_file(&bundle.name, &contents.join("\n")).await?;
        Logger::debug(&format!("Wrote {}", bundle.name.display()));
        Ok(())
    }
}

/// Concatenates stylesheets, wrapping an asset in `@media` when every
/// reference to it was a media-qualified `@import`
pub struct CssPackager {
    fs: Arc<dyn FileSystemService>,
}

impl CssPackager {
    pub fn new(fs: Arc<dyn FileSystemService>) -> Self {
        Self { fs }
    }

    fn render(asset: &PackagedAsset) -> String {
        let media: Option<Vec<&str>> = if asset.incoming.is_empty() {
            None
        } else {
            asset.incoming.iter().map(|dep| dep.media.as_deref()).collect()
        };

        match media {
            Some(queries) => format!("@media {} {{\n{}\n}}\n", queries.join(", "), asset.content.trim()),
            None => asset.content.clone(),
        }
    }
}

#[async_trait]
impl Packager for CssPackager {
    async fn package(&self, bundle: &PackagedBundle) -> Result<()> {
        let contents: Vec<String> = bundle.assets.iter().map(Self::render).collect();
        self.fs.write_file(&bundle.name, &contents.join("\n")).await?;
        Logger::debug(&format!("Wrote {}", bundle.name.display()));
        Ok(())
    }
}
