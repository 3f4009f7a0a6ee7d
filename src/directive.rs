// src/directive.rs

//! Install directives and emitters
//!
//! A finished plan is an ordered list of [`Directive`]s. Emitters turn that
//! list into an external artifact; each emitter decides which directive kinds
//! it can express and rejects the rest.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use strum_macros::IntoStaticStr;

/// One atomic install instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Directive {
    /// Image the rest of the directives apply on top of
    BaseImage { image: String },
    /// Shell command run inside the image
    RunCommand { command: String },
    /// Environment variable set for subsequent steps
    Environment { key: String, value: String },
    /// File placed into the image
    AddFile {
        filename: String,
        contents: String,
        #[serde(default)]
        executable: bool,
    },
    /// Port published by the image
    ExportPort { name: String, port: u16 },
}

impl Directive {
    pub fn base_image(image: impl Into<String>) -> Self {
        Directive::BaseImage {
            image: image.into(),
        }
    }

    pub fn run(command: impl Into<String>) -> Self {
        Directive::RunCommand {
            command: command.into(),
        }
    }

    /// Short kind name, e.g. `run_command`
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

/// Something that renders a directive list into an artifact
pub trait DirectiveEmitter {
    fn emit(&self, directives: &[Directive], out: &mut dyn Write) -> Result<()>;

    /// Render into a `String`
    fn emit_to_string(&self, directives: &[Directive]) -> Result<String> {
        let mut buf = Vec::new();
        self.emit(directives, &mut buf)?;
        String::from_utf8(buf).map_err(|e| Error::ParseError(e.to_string()))
    }
}

/// Line-oriented Dockerfile emitter (`FROM` / `RUN`)
#[derive(Debug, Default, Clone, Copy)]
pub struct Dockerfile;

impl DirectiveEmitter for Dockerfile {
    fn emit(&self, directives: &[Directive], out: &mut dyn Write) -> Result<()> {
        for directive in directives {
            match directive {
                Directive::BaseImage { image } => writeln!(out, "FROM {}", image)?,
                Directive::RunCommand { command } => writeln!(out, "RUN {}", command)?,
                other => return Err(Error::UnsupportedDirective(other.kind().to_string())),
            }
        }
        Ok(())
    }
}
