// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use vkr_core::init_tracing;
use vkr_platform::{drawable_size, window_attributes, WindowOptions};
use vkr_render::{FramePacing, FrameStatus, RenderSettings, RenderSize, Renderer};
use vkr_render_vk::VkRenderer;

use vkr_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    raw_window_handle::{HasDisplayHandle, HasWindowHandle},
    window::{Window, WindowId},
};

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file; missing file means defaults
    #[arg(long, default_value = "vkr.toml")]
    config: PathBuf,

    /// Overrides render.pacing from the config
    #[arg(long, value_enum)]
    pacing: Option<PacingCfg>,

    /// Exit cleanly after this many presented frames
    #[arg(long)]
    frames: Option<u64>,

    /// Keep +Y pointing down in clip space
    #[arg(long)]
    no_flip_y: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
enum PacingCfg {
    #[default]
    Idle,
    Fenced,
}

impl From<PacingCfg> for FramePacing {
    fn from(p: PacingCfg) -> Self {
        match p {
            PacingCfg::Idle => FramePacing::Idle,
            PacingCfg::Fenced => FramePacing::Fenced,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
struct WindowCfg {
    title: String,
    width: u32,
    height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        let opts = WindowOptions::default();
        Self {
            title: opts.title,
            width: opts.width,
            height: opts.height,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
struct RenderCfg {
    clear_color: [f32; 4],
    flip_y: bool,
    pacing: PacingCfg,
    acquire_timeout_ns: u64,
}

impl Default for RenderCfg {
    fn default() -> Self {
        let s = RenderSettings::default();
        RenderCfg {
            clear_color: s.clear_color,
            flip_y: s.flip_y,
            pacing: PacingCfg::Idle,
            acquire_timeout_ns: s.acquire_timeout_ns,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(default)]
struct AppCfg {
    window: WindowCfg,
    render: RenderCfg,
}

impl AppCfg {
    // CLI wins over the file
    fn apply_args(&mut self, args: &Args) {
        if let Some(p) = args.pacing {
            self.render.pacing = p;
        }
        if args.no_flip_y {
            self.render.flip_y = false;
        }
    }

    fn window_options(&self) -> WindowOptions {
        WindowOptions {
            title: self.window.title.clone(),
            width: self.window.width,
            height: self.window.height,
        }
    }

    fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            clear_color: self.render.clear_color,
            flip_y: self.render.flip_y,
            pacing: self.render.pacing.into(),
            acquire_timeout_ns: self.render.acquire_timeout_ns,
        }
    }
}

fn parse_cfg(s: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str::<AppCfg>(s)
}

fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).unwrap_or_else(|e| {
            warn!("{}: invalid config, using defaults: {e}", path.display());
            AppCfg::default()
        }),
        Err(e) => {
            warn!("{}: {e}, using defaults", path.display());
            AppCfg::default()
        }
    }
}

struct App {
    cfg: AppCfg,
    frame_limit: Option<u64>,
    window: Option<Window>,
    renderer: Option<VkRenderer>,

    exiting: bool,
    presented: u64,
    frames: u32,
    skipped: u32,
    last_fps_instant: Instant,

    // surfaced from main so the process exits non-zero
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(cfg: AppCfg, frame_limit: Option<u64>) -> Self {
        Self {
            cfg,
            frame_limit,
            window: None,
            renderer: None,
            exiting: false,
            presented: 0,
            frames: 0,
            skipped: 0,
            last_fps_instant: Instant::now(),
            fatal: None,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = event_loop
            .create_window(window_attributes(&self.cfg.window_options()))
            .context("create_window")?;
        let size = drawable_size(&window);

        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("window_handle: {e}"))?;
        let dh = window
            .display_handle()
            .map_err(|e| anyhow!("display_handle: {e}"))?;
        let renderer = VkRenderer::new(&wh, &dh, size, self.cfg.render_settings())
            .context("vulkan renderer init")?;

        info!(
            "window {}x{}, pacing={:?}, flip_y={}",
            size.width, size.height, self.cfg.render.pacing, self.cfg.render.flip_y
        );

        window.request_redraw();
        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    // Renderer goes first: its surface borrows the window.
    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("fatal: {e:#}");
        self.fatal = Some(e);
        self.shutdown(event_loop);
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(renderer) = &mut self.renderer else {
            return;
        };
        match renderer.render() {
            Ok(FrameStatus::Presented { .. }) => {
                self.presented += 1;
                self.frames = self.frames.saturating_add(1);
                if self.frame_limit.is_some_and(|n| self.presented >= n) {
                    info!("presented {} frames, exiting", self.presented);
                    self.shutdown(event_loop);
                }
            }
            Ok(FrameStatus::Skipped) => {
                self.skipped = self.skipped.saturating_add(1);
            }
            Err(e) => self.fail(event_loop, e),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.init(event_loop) {
                self.fail(event_loop, e);
                return;
            }
        }
        event_loop.set_control_flow(ControlFlow::Poll);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                let size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                info!("Resized → {}x{}", size.width, size.height);
                if let Some(renderer) = &mut self.renderer {
                    if let Err(e) = renderer.resize(size) {
                        self.fail(event_loop, e);
                        return;
                    }
                }
                if let Some(w) = &self.window {
                    w.request_redraw();
                }
            }

            WindowEvent::RedrawRequested => {
                if !self.exiting {
                    self.redraw(event_loop);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }

        // a minimised window has nothing to draw; wake on the next resize
        let minimised = self
            .window
            .as_ref()
            .is_some_and(|w| drawable_size(w).is_empty());
        if minimised {
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }

        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {} (skipped {})", self.frames, self.skipped);
            self.frames = 0;
            self.skipped = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut cfg = load_cfg(&args.config);
    cfg.apply_args(&args);

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg, args.frames);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse_cfg("").unwrap();
        assert_eq!(cfg, AppCfg::default());
        assert_eq!(cfg.render_settings(), RenderSettings::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = parse_cfg(
            r#"
            [window]
            width = 640

            [render]
            pacing = "fenced"
            flip_y = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.window.width, 640);
        assert_eq!(cfg.window.height, WindowCfg::default().height);
        assert_eq!(cfg.render.pacing, PacingCfg::Fenced);
        assert!(!cfg.render.flip_y);
        assert_eq!(cfg.render.acquire_timeout_ns, 0);
        assert_eq!(cfg.render_settings().pacing, FramePacing::Fenced);
    }

    #[test]
    fn unknown_pacing_is_rejected() {
        assert!(parse_cfg("[render]\npacing = \"mailbox\"\n").is_err());
    }

    #[test]
    fn cli_overrides_file() {
        let mut cfg = parse_cfg("[render]\npacing = \"fenced\"\n").unwrap();
        let args = Args::parse_from(["vkr", "--pacing", "idle", "--no-flip-y", "--frames", "3"]);
        cfg.apply_args(&args);
        assert_eq!(cfg.render.pacing, PacingCfg::Idle);
        assert!(!cfg.render.flip_y);
        assert_eq!(args.frames, Some(3));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load_cfg(Path::new("does/not/exist/vkr.toml"));
        assert_eq!(cfg, AppCfg::default());
    }
}
