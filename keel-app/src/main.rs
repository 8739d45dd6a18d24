#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod frame;
mod ingest;
mod renderer;
mod vertex;

use std::{
    fs::{self, File},
    path::PathBuf,
    sync::Arc,
};

use clap::Parser;
use keel_vk::instance::{Instance, InstanceExtensions};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::{ElementState, WindowEvent},
    event_loop::ControlFlow,
    keyboard::{Key, NamedKey},
    window::{Window as WinitWindow, WindowAttributes},
};

use crate::renderer::Renderer;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Info,
    Debug,
    Warn,
    #[default]
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            // We clamp this to the lowest possible level but this shouldn't happen
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(clap::Parser, Debug)]
struct CliArgs {
    /// Scene document to render.
    #[arg(default_value = "scene.gltf")]
    scene: PathBuf,
    #[arg(short, long, default_value = "error")]
    tracing_log_level: TracingLogLevel,
    #[arg(short, long)]
    vulkan_log_level: Option<CliVulkanLogLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for keel_vk::instance::VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => keel_vk::instance::VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => keel_vk::instance::VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => keel_vk::instance::VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => keel_vk::instance::VulkanLogLevel::Error,
        }
    }
}

fn main() -> eyre::Result<()> {
    let app_dirs = directories::ProjectDirs::from("", "keel", "keel-app");

    let log_dir = match app_dirs
        .as_ref()
        .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
        .map(|p| p.to_owned())
    {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    let cli_args = CliArgs::parse();

    if cli_args.tracing_log_level != TracingLogLevel::Off {
        fs::create_dir_all(&log_dir)?;

        let mut log_file_path = log_dir.clone();
        log_file_path.push("log-file");
        log_file_path.set_extension("txt");
        let log_file = File::create(&log_file_path)?;
        let file_log = tracing_subscriber::fmt::layer()
            .with_writer(log_file)
            .with_ansi(false);

        println!("log_file_path: {}", log_file_path.display());
        println!("cli_args: {:#?}", cli_args);

        let stdout_log = tracing_subscriber::fmt::layer().pretty();

        tracing_subscriber::registry()
            .with(
                stdout_log
                    .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                        cli_args.tracing_log_level.into(),
                    ))
                    .and_then(file_log),
            )
            .init();
    }

    let event_loop = winit::event_loop::EventLoop::builder().build()?;

    // SAFETY: Loads vulkan via libloading which is kinda unsafe but we're fine
    let instance = Arc::new(unsafe {
        Instance::new(
            "keel",
            cli_args.vulkan_log_level.map(Into::into),
            Some(&event_loop),
            InstanceExtensions { surface: true },
        )
    }?);

    let mut app = AppRunner {
        state: Some(App::Initializing(InitializingState {
            instance,
            scene_path: cli_args.scene,
        })),
        exit_error: None,
    };

    tracing::trace!("Entering main event loop");
    event_loop.run_app(&mut app)?;
    match app.exit_error {
        Some(report) => Err(report),
        None => Ok(()),
    }
}

#[derive(Debug)]
struct AppRunner {
    state: Option<App>,
    /// First fatal error observed inside the event loop. `run_app`
    /// itself only reports loop failures, so this carries renderer
    /// errors out to `main`'s exit status.
    exit_error: Option<eyre::Report>,
}

#[derive(Debug)]
enum App {
    Running(RunningState),
    Initializing(InitializingState),
    Exiting(ExitingState),
}

#[derive(Debug)]
struct InitializingState {
    instance: Arc<Instance>,
    scene_path: PathBuf,
}
#[derive(Debug)]
struct RunningState {
    win: Arc<WinitWindow>,
    renderer: Renderer,
}
#[derive(Debug)]
struct ExitingState {}

impl ApplicationHandler for AppRunner {
    fn resumed(&mut self, event_loop: &winit::event_loop::ActiveEventLoop) {
        assert!(self.state.is_some());
        if let Some(initializing_state) = self.take_initializing() {
            event_loop.set_control_flow(ControlFlow::Poll);
            let win = Arc::new(
                match event_loop.create_window(
                    WindowAttributes::default()
                        .with_title("keel")
                        .with_inner_size(LogicalSize {
                            width: 1024,
                            height: 768,
                        })
                        .with_resizable(false),
                ) {
                    Ok(w) => w,
                    Err(e) => {
                        self.fail(
                            "Initializing",
                            event_loop,
                            eyre::Report::new(e).wrap_err("Error while creating window"),
                        );
                        return;
                    }
                },
            );

            let renderer = match Renderer::new(
                initializing_state.instance,
                Arc::clone(&win),
                &initializing_state.scene_path,
            ) {
                Ok(r) => r,
                Err(e) => {
                    self.fail(
                        "Initializing",
                        event_loop,
                        eyre::Report::new(e).wrap_err("Error while initializing renderer"),
                    );
                    return;
                }
            };

            tracing::debug!("State transition: Initializing -> Running");
            self.set_running(RunningState { win, renderer });
        } else if self.is_exiting() {
            tracing::warn!("resumed() called while in Exiting state");
        }
    }

    fn suspended(&mut self, _event_loop: &winit::event_loop::ActiveEventLoop) {
        assert!(self.state.is_some());
        if self.is_running() {
            tracing::warn!("Suspend requested but suspend/resume is unsupported; continuing");
        }
    }

    fn window_event(
        &mut self,
        event_loop: &winit::event_loop::ActiveEventLoop,
        window_id: winit::window::WindowId,
        window_event: winit::event::WindowEvent,
    ) {
        assert!(self.state.is_some());
        if !self.is_running_window(window_id) {
            return;
        }

        if matches!(&window_event, WindowEvent::CloseRequested) {
            tracing::trace!("Close window request received for window");
            self.exit_from_running(event_loop);
            return;
        }

        match &window_event {
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state == ElementState::Pressed
                    && event.logical_key == Key::Named(NamedKey::Escape)
                {
                    tracing::trace!("Escape pressed; exiting");
                    self.exit_from_running(event_loop);
                }
            }
            WindowEvent::RedrawRequested => {
                let draw_result = match self.as_running_mut() {
                    Some(running_state) => running_state.renderer.draw(),
                    None => return,
                };
                if let Err(e) = draw_result {
                    self.fail(
                        "Running",
                        event_loop,
                        eyre::Report::new(e).wrap_err("Error while drawing frame"),
                    );
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &winit::event_loop::ActiveEventLoop) {
        assert!(self.state.is_some());
        if let Some(running_state) = self.as_running_mut() {
            running_state.renderer.tick();
            running_state.win.request_redraw();
        }
    }
}

#[allow(dead_code, reason = "these functions exist for API completeness")]
impl AppRunner {
    /// Record the first fatal error, tear down whatever state is live,
    /// and transition to Exiting.
    fn fail(
        &mut self,
        from_state: &'static str,
        event_loop: &winit::event_loop::ActiveEventLoop,
        report: eyre::Report,
    ) {
        tracing::error!("{report:#}");
        if self.exit_error.is_none() {
            self.exit_error = Some(report);
        }
        drop(self.state.take());
        self.transition_to_exiting(from_state, event_loop);
    }

    fn transition_to_exiting(
        &mut self,
        from_state: &'static str,
        event_loop: &winit::event_loop::ActiveEventLoop,
    ) {
        tracing::debug!("State transition: {} -> Exiting", from_state);
        self.set_exiting(ExitingState {});
        event_loop.exit();
    }

    fn exit_from_running(&mut self, event_loop: &winit::event_loop::ActiveEventLoop) {
        if self.take_running().is_some() {
            self.transition_to_exiting("Running", event_loop);
        } else {
            tracing::warn!("Requested Running -> Exiting transition while not in Running state");
            event_loop.exit();
        }
    }

    fn is_running_window(&self, window_id: winit::window::WindowId) -> bool {
        if let Some(running_state) = self.as_running()
            && window_id == running_state.win.id()
        {
            true
        } else {
            false
        }
    }

    fn is_initializing(&self) -> bool {
        assert!(self.state.is_some());
        matches!(self.state, Some(App::Initializing(_)))
    }

    fn take_initializing(&mut self) -> Option<InitializingState> {
        assert!(self.state.is_some());
        if matches!(self.state, Some(App::Initializing(_))) {
            match self.state.take() {
                Some(App::Initializing(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn as_initializing(&self) -> Option<&InitializingState> {
        assert!(self.state.is_some());
        match &self.state {
            Some(App::Initializing(s)) => Some(s),
            _ => None,
        }
    }

    fn as_initializing_mut(&mut self) -> Option<&mut InitializingState> {
        assert!(self.state.is_some());
        match &mut self.state {
            Some(App::Initializing(s)) => Some(s),
            _ => None,
        }
    }

    fn set_initializing(&mut self, state: InitializingState) {
        assert!(self.state.is_none());
        self.state = Some(App::Initializing(state));
    }

    fn is_running(&self) -> bool {
        assert!(self.state.is_some());
        matches!(self.state, Some(App::Running(_)))
    }

    fn take_running(&mut self) -> Option<RunningState> {
        assert!(self.state.is_some());
        if matches!(self.state, Some(App::Running(_))) {
            match self.state.take() {
                Some(App::Running(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn as_running(&self) -> Option<&RunningState> {
        assert!(self.state.is_some());
        match &self.state {
            Some(App::Running(s)) => Some(s),
            _ => None,
        }
    }

    fn as_running_mut(&mut self) -> Option<&mut RunningState> {
        assert!(self.state.is_some());
        match &mut self.state {
            Some(App::Running(s)) => Some(s),
            _ => None,
        }
    }

    fn set_running(&mut self, state: RunningState) {
        assert!(self.state.is_none());
        self.state = Some(App::Running(state));
    }

    fn is_exiting(&self) -> bool {
        assert!(self.state.is_some());
        matches!(self.state, Some(App::Exiting(_)))
    }

    fn take_exiting(&mut self) -> Option<ExitingState> {
        assert!(self.state.is_some());
        if matches!(self.state, Some(App::Exiting(_))) {
            match self.state.take() {
                Some(App::Exiting(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn as_exiting(&self) -> Option<&ExitingState> {
        assert!(self.state.is_some());
        match &self.state {
            Some(App::Exiting(s)) => Some(s),
            _ => None,
        }
    }

    fn as_exiting_mut(&mut self) -> Option<&mut ExitingState> {
        assert!(self.state.is_some());
        match &mut self.state {
            Some(App::Exiting(s)) => Some(s),
            _ => None,
        }
    }

    fn set_exiting(&mut self, state: ExitingState) {
        assert!(self.state.is_none());
        self.state = Some(App::Exiting(state));
    }
}
