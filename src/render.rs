//! Page rendering. The handler only knows the [`Render`] seam; production
//! uses a Tera template loaded from the configured views directory.

use std::path::Path;
use std::sync::Arc;
use tera::{Context, Tera};
use thiserror::Error;

use crate::view::ViewModel;

pub const INDEX_TEMPLATE: &str = "index.html";

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("template error: {0}")]
    Template(#[from] tera::Error),
}

pub trait Render: Send + Sync + 'static {
    fn render(&self, view: &ViewModel) -> Result<String, RenderError>;
}

impl<R: Render> Render for Arc<R> {
    fn render(&self, view: &ViewModel) -> Result<String, RenderError> {
        (**self).render(view)
    }
}

pub struct TeraRenderer {
    tera: Tera,
}

impl TeraRenderer {
    /// Load `index.html` from the views directory
    pub fn load(views: &Path) -> Result<Self, RenderError> {
        let mut tera = Tera::default();
        tera.add_template_file(views.join(INDEX_TEMPLATE), Some(INDEX_TEMPLATE))?;
        Ok(Self { tera })
    }

    pub fn from_source(source: &str) -> Result<Self, RenderError> {
        let mut tera = Tera::default();
        tera.add_raw_template(INDEX_TEMPLATE, source)?;
        Ok(Self { tera })
    }
}

impl Render for TeraRenderer {
    fn render(&self, view: &ViewModel) -> Result<String, RenderError> {
        let context = Context::from_serialize(view)?;
        Ok(self.tera.render(INDEX_TEMPLATE, &context)?)
    }
}
