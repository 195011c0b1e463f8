use crate::utils::{format_bytes, RateCounter};
use crate::{AcquisitionEngine, AcquisitionStatus, Conf, EventWriter, RawEvent};
use anyhow::Result;
use crossbeam_channel::tick;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use log::{info, warn};
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::Stylize,
    symbols::border,
    text::{Line, Text},
    widgets::{Block, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::time::{Duration, Instant};

const REFRESH: Duration = Duration::from_millis(500);
const POP_TIMEOUT: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    Quit,
    Timeout,
    /// The readout stopped on a hardware or consistency fault.
    Fault(AcquisitionStatus),
    /// The readout loop returned without a fault.
    Stopped,
}

/// Consumes a run's events into the writer and shows its progress.
#[derive(Debug)]
pub struct Monitor {
    pub counter: RateCounter,
    pub t_begin: Instant,
    pub run_duration: Option<Duration>,
    pub run_id: u32,
    pub queue_depth: usize,
    pub capacity: usize,
    pub dropped: u64,
    pub file: String,
    pub exit: Option<MonitorExit>,
}

impl Monitor {
    pub fn new(conf: &Conf) -> Self {
        let run_duration = match conf.run.run_duration {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self {
            counter: RateCounter::new(),
            t_begin: Instant::now(),
            run_duration,
            run_id: conf.run.run_id,
            queue_depth: 0,
            capacity: conf.run.queue_capacity,
            dropped: 0,
            file: String::new(),
            exit: None,
        }
    }

    /// Start a run, write its events until the operator quits, the run time
    /// is up or the readout faults, then stop the run and drain the queue.
    ///
    /// Without a terminal the run only ends on timeout or fault.
    pub fn run(
        &mut self,
        engine: &mut AcquisitionEngine,
        writer: &mut EventWriter,
        mut terminal: Option<&mut DefaultTerminal>,
    ) -> Result<MonitorExit> {
        let ticker = tick(REFRESH);
        self.t_begin = Instant::now();
        self.counter.reset();
        self.exit = None;
        self.capacity = engine.capacity();
        engine.start_run()?;

        while self.exit.is_none() {
            while ticker.is_empty() && self.exit.is_none() {
                match engine.get_next_event(Some(POP_TIMEOUT)) {
                    Some(event) => self.store(writer, &event)?,
                    None => {
                        let status = engine.get_status();
                        if status != AcquisitionStatus::Normal {
                            self.exit = Some(MonitorExit::Fault(status));
                        } else if !engine.is_running() {
                            self.exit = Some(MonitorExit::Stopped);
                        }
                    }
                }
            }
            let _ = ticker.try_recv();

            self.queue_depth = engine.queue_depth();
            self.dropped = engine.stats().dropped_events;
            if let Some(path) = writer.current_filename() {
                self.file = path.display().to_string();
            }
            if let Some(limit) = self.run_duration {
                if self.t_begin.elapsed() >= limit {
                    self.exit.get_or_insert(MonitorExit::Timeout);
                }
            }
            if let Some(terminal) = terminal.as_mut() {
                self.handle_events()?;
                terminal.draw(|f| self.draw(f))?;
            }
        }

        engine.end_run(false)?;
        let mut drained = 0usize;
        for event in engine.drain() {
            self.store(writer, &event)?;
            drained += 1;
        }
        if drained > 0 {
            info!("Wrote {} events left in the queue", drained);
        }
        let exit = self.exit.unwrap_or(MonitorExit::Quit);
        match exit {
            MonitorExit::Fault(status) => warn!(
                "Run {} stopped on {:?} after {} events",
                self.run_id, status, self.counter.n_events
            ),
            _ => info!(
                "Run {} finished: {} events, {}",
                self.run_id,
                self.counter.n_events,
                format_bytes(self.counter.total_bytes)
            ),
        }
        Ok(exit)
    }

    fn store(&mut self, writer: &mut EventWriter, event: &RawEvent) -> Result<()> {
        writer.process(event)?;
        self.counter.record(event.data_size());
        Ok(())
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            if let Event::Key(key_event) = event::read()? {
                if key_event.kind == KeyEventKind::Press {
                    self.handle_key_event(key_event);
                }
            }
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        if let KeyCode::Char('q') = key_event.code {
            self.exit = Some(MonitorExit::Quit);
        }
    }
}

impl Widget for &Monitor {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let title = Line::from(format!(" Run {} Status ", self.run_id).bold());
        let instructions = Line::from(vec![" Quit ".into(), "<Q> ".blue().bold()]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);

        let queue = format!("{}/{}", self.queue_depth, self.capacity);
        let status_text = Text::from(vec![
            Line::from(vec![
                "Elapsed time: ".into(),
                self.t_begin.elapsed().as_secs().to_string().yellow(),
                " s".into(),
                " Events: ".into(),
                self.counter.n_events.to_string().yellow(),
                " Rate: ".into(),
                format!("{:.1}", self.counter.event_rate()).yellow(),
                " Hz ".into(),
                format!("{:.2}", self.counter.rate()).yellow(),
                " MB/s".into(),
            ]),
            Line::from(vec![
                "Queue: ".into(),
                if self.queue_depth >= self.capacity {
                    queue.red()
                } else {
                    queue.yellow()
                },
                " Dropped: ".into(),
                self.dropped.to_string().yellow(),
                " Written: ".into(),
                format_bytes(self.counter.total_bytes).yellow(),
            ]),
            Line::from(vec!["File: ".into(), self.file.clone().yellow()]),
        ]);

        Paragraph::new(status_text)
            .centered()
            .block(block)
            .render(area, buf);
    }
}
