use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use crossterm::event::{DisableMouseCapture, EnableMouseCapture};
use log::info;
use ratatui::DefaultTerminal;
use rowscope::{
    logging, AppConfig, AppEvent, Args, ConfigManager, DataFetcher, ReqwestTransport,
    SessionOptions, SseConnector, StreamIngester, Theme, APP_NAME,
};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::time::{Duration, Instant};

type App = rowscope::App;

fn render(terminal: &mut DefaultTerminal, app: &mut App) -> Result<()> {
    terminal.draw(|frame| frame.render_widget(app, frame.area()))?;
    Ok(())
}

fn run(
    mut terminal: DefaultTerminal,
    options: SessionOptions,
    theme: Theme,
    config: &AppConfig,
    log: logging::LogBuffer,
    runtime: &tokio::runtime::Runtime,
    debug: bool,
) -> Result<()> {
    let (tx, rx) = channel::<AppEvent>();
    let poll_interval = options.event_poll_interval;
    let request = options.request.clone();
    let mut app = App::new(tx.clone(), runtime.handle().clone(), options, theme)?;
    if debug {
        app.enable_debug(Some(log), config.debug.log_lines);
    }
    render(&mut terminal, &mut app)?;
    if let Some(request) = request {
        tx.send(AppEvent::Load(request))?;
    }

    loop {
        if crossterm::event::poll(poll_interval)? {
            match crossterm::event::read()? {
                crossterm::event::Event::Key(key) => tx.send(AppEvent::Key(key))?,
                crossterm::event::Event::Mouse(mouse) => tx.send(AppEvent::Mouse(mouse))?,
                crossterm::event::Event::Resize(cols, rows) => {
                    tx.send(AppEvent::Resize(cols, rows))?
                }
                _ => {}
            }
        }

        let mut updated = app.tick(Instant::now());
        // drain everything queued; stream chunks arrive in bursts
        loop {
            match rx.recv_timeout(Duration::from_millis(0)) {
                Ok(AppEvent::Exit) => return Ok(()),
                Ok(AppEvent::Crash(msg)) => return Err(eyre!(msg)),
                Ok(event) => {
                    if let Some(event) = app.event(&event) {
                        tx.send(event)?;
                    }
                    updated = true;
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }

        if updated {
            render(&mut terminal, &mut app)?;
        }
    }
}

fn handle_early_exit_flags(args: &Args) -> Result<Option<()>> {
    if args.generate_config {
        let manager = ConfigManager::new(APP_NAME)?;
        match manager.write_default_config(args.force) {
            Ok(path) => {
                println!("Wrote default configuration to {}", path.display());
                return Ok(Some(()));
            }
            Err(e) => {
                eprintln!("Error writing configuration: {}", e);
                std::process::exit(1);
            }
        }
    }
    Ok(None)
}

fn export_headless(options: &SessionOptions, runtime: &tokio::runtime::Runtime) -> Result<()> {
    let timeout = options.fetch.timeout;
    let fetcher = DataFetcher::new(ReqwestTransport::new(), options.fetch.clone());
    let connector = SseConnector::new(runtime.handle().clone(), timeout, timeout)?;
    let mut ingester = StreamIngester::new(connector, options.stream_options.clone());
    let path = rowscope::export_headless(options, &fetcher, &mut ingester, runtime.handle())?;
    println!("{}", path.display());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(()) = handle_early_exit_flags(&args)? {
        return Ok(());
    }

    color_eyre::install()?;
    let config = AppConfig::load(APP_NAME)?;
    let level = logging::parse_level(&config.debug.log_level)
        .ok_or_else(|| eyre!("unknown debug.log_level '{}'", config.debug.log_level))?;
    let log = logging::init(config.debug.log_lines, level);
    let options = SessionOptions::from_args_and_config(&args, &config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    if args.export {
        log.set_mirror_to_stderr(true);
        return export_headless(&options, &runtime);
    }

    let theme = Theme::from_config(&config.theme)?;
    info!("starting {} {}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let terminal = ratatui::init();
    crossterm::execute!(std::io::stdout(), EnableMouseCapture)?;
    let result = run(
        terminal,
        options,
        theme,
        &config,
        log,
        &runtime,
        args.debug || config.debug.enabled,
    );
    let _ = crossterm::execute!(std::io::stdout(), DisableMouseCapture);
    ratatui::restore();
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
