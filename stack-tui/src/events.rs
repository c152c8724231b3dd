use color_eyre::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use crate::app::{App, AppState};

pub trait EventHandler {
    fn handle_events(&mut self) -> Result<()>;
    fn handle_key_event(&mut self, key_event: KeyEvent) -> Result<()>;
}

impl EventHandler for App {
    fn handle_events(&mut self) -> Result<()> {
        if event::poll(std::time::Duration::from_millis(100))? {
            match event::read()? {
                Event::Key(key_event) if key_event.kind == KeyEventKind::Press => {
                    self.handle_key_event(key_event)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) -> Result<()> {
        // raw mode swallows SIGINT, so Ctrl-C arrives as a key
        if key_event.code == KeyCode::Char('c') && key_event.modifiers.contains(KeyModifiers::CONTROL)
        {
            if self.run.is_complete {
                self.quit();
            } else {
                self.request_cancel();
            }
            return Ok(());
        }

        match self.state {
            AppState::Dashboard => match key_event.code {
                KeyCode::Char('q') | KeyCode::Esc => self.quit(),
                KeyCode::Char('c') => self.request_cancel(),
                KeyCode::Up | KeyCode::Char('k') => self.move_up(),
                KeyCode::Down | KeyCode::Char('j') => self.move_down(),
                KeyCode::Enter => self.open_log_viewer(true),
                KeyCode::Char('l') => self.open_log_viewer(false),
                _ => {}
            },
            AppState::RunLog if self.log_viewer.search_active => match key_event.code {
                KeyCode::Enter => self.confirm_search(),
                KeyCode::Esc => self.cancel_search(),
                KeyCode::Backspace => self.search_pop_char(),
                KeyCode::Char(c) => self.search_push_char(c),
                _ => {}
            },
            AppState::RunLog => match key_event.code {
                KeyCode::Char('q') | KeyCode::Esc => self.back_to_dashboard(),
                KeyCode::Up | KeyCode::Char('k') => self.move_up(),
                KeyCode::Down | KeyCode::Char('j') => self.move_down(),
                KeyCode::PageUp => self.page_up(),
                KeyCode::PageDown => self.page_down(),
                KeyCode::Char('g') => self.scroll_top(),
                KeyCode::Char('G') => self.scroll_bottom(),
                KeyCode::Char('/') => self.start_search(),
                KeyCode::Char('n') => self.next_search_match(),
                _ => {}
            },
        }
        Ok(())
    }
}
