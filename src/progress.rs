use std::borrow::Cow;
use std::time::Duration;

use indicatif::style::TemplateError;
use indicatif::{ProgressBar, ProgressStyle};

use crate::render::ProgressRenderer;

fn create_spinning_indicator() -> Result<ProgressBar, TemplateError> {
    let pb = ProgressBar::new(1);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} {spinner}")?
            .tick_chars("/-\\|"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

#[derive(Debug)]
pub(crate) struct ProgressBarFactory {
    hide: bool,
    plain: ProgressRenderer,
}

impl ProgressBarFactory {
    pub(crate) fn new(hide: bool) -> Self {
        Self {
            hide,
            plain: Default::default(),
        }
    }

    /// create new progress bar
    pub(crate) fn create(&self) -> Result<ProgressRenderer, TemplateError> {
        if self.hide || std::env::var("CI").is_ok() {
            Ok(Default::default())
        } else {
            Ok(create_spinning_indicator()?.into())
        }
    }

    /// simple print
    #[allow(unused)]
    pub(crate) fn println(&self, msg: impl Into<Cow<'static, str>>) {
        self.plain.println(msg.into());
    }
}
