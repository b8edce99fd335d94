//! Window compositor: per-window ARGB8888 backbuffers, z-ordered
//! compositing onto the shared framebuffer, a tiny embedded terminal
//! emulator per window, and mouse/click routing.
//!
//! No source in the retrieval pack ships a GUI layer; this module's
//! structure is grounded on this crate's own "owned state behind a
//! [`SpinLock`], IRQ-masked critical section" discipline
//! ([`crate::process`]'s table, [`crate::memory`]'s zones).

use alloc::string::String;
use alloc::vec::Vec;

use crate::config;
use crate::virtio::gpu::GpuDevice;
use crate::sync::{OnceLock, SpinLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionDenied;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoSuchWindow;

/// Escape-sequence parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Normal,
    SawEsc,
    InCsi,
}

const PARAM_CAPACITY: usize = 16;

struct Terminal {
    cursor_x: i32,
    cursor_y: i32,
    foreground: u32,
    state: ParseState,
    params: [u8; PARAM_CAPACITY],
    params_len: usize,
}

const COLS_PER_GLYPH: i32 = 8;
const ROWS_PER_GLYPH: i32 = 16;

const WHITE: u32 = 0xFFFF_FFFF;

/// Standard 30-37 / bright 90-97 SGR foreground palette.
const PALETTE: [u32; 8] = [
    0xFF00_0000, // black
    0xFFAA_0000, // red
    0xFF00_BB00, // green
    0xFFAA_5500, // yellow
    0xFF00_00AA, // blue
    0xFFAA_00AA, // magenta
    0xFF00_AAAA, // cyan
    0xFFAA_AAAA, // white
];
const PALETTE_BRIGHT: [u32; 8] = [
    0xFF55_5555,
    0xFFFF_5555,
    0xFF55_FF55,
    0xFFFF_FF55,
    0xFF55_55FF,
    0xFFFF_55FF,
    0xFF55_FFFF,
    0xFFFF_FFFF,
];

impl Terminal {
    const fn new() -> Self {
        Self {
            cursor_x: 0,
            cursor_y: 0,
            foreground: WHITE,
            state: ParseState::Normal,
            params: [0; PARAM_CAPACITY],
            params_len: 0,
        }
    }
}

pub struct Window {
    pub id: u32,
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
    pub z: i32,
    pub visible: bool,
    pub owner: u32,
    pub protected: bool,
    pixels: Vec<u32>,
    background: u32,
    /// Carried on the window record; this core has no font table to
    /// render it with, so it is stored but not drawn.
    #[allow(dead_code)]
    title: String,
    terminal: Terminal,
}

impl Window {
    fn client_rows(&self) -> i32 {
        (self.h as i32).max(0) / ROWS_PER_GLYPH
    }

    fn client_cols(&self) -> i32 {
        (self.w as i32).max(0) / COLS_PER_GLYPH
    }

    fn clear(&mut self) {
        self.pixels.fill(self.background);
    }

    fn put_pixel(&mut self, x: i32, y: i32, color: u32) {
        if x < 0 || y < 0 || x as u32 >= self.w || y as u32 >= self.h {
            return;
        }
        let index = y as usize * self.w as usize + x as usize;
        self.pixels[index] = color;
    }

    /// Fills the 8x16 cell at the terminal's current cursor with a
    /// solid block in the active foreground color. A placeholder glyph:
    /// this core has no font table, so every printable character renders
    /// as the same cell, which still exercises cursor advance/scroll/SGR.
    fn draw_cell(&mut self) {
        let fg = self.terminal.foreground;
        let base_x = self.terminal.cursor_x * COLS_PER_GLYPH;
        let base_y = self.terminal.cursor_y * ROWS_PER_GLYPH;
        for dy in 0..ROWS_PER_GLYPH {
            for dx in 0..COLS_PER_GLYPH {
                self.put_pixel(base_x + dx, base_y + dy, fg);
            }
        }
    }

    fn scroll_up_one_row(&mut self) {
        let row_pixels = self.w as usize * ROWS_PER_GLYPH as usize;
        let total = self.pixels.len();
        if total <= row_pixels {
            self.clear();
            return;
        }
        self.pixels.copy_within(row_pixels..total, 0);
        let background = self.background;
        self.pixels[total - row_pixels..].fill(background);
    }

    fn newline(&mut self) {
        self.terminal.cursor_x = 0;
        self.terminal.cursor_y += 1;
        if self.terminal.cursor_y >= self.client_rows() {
            self.scroll_up_one_row();
            self.terminal.cursor_y = self.client_rows().saturating_sub(1);
        }
    }

    fn advance_cursor(&mut self) {
        self.terminal.cursor_x += 1;
        if self.terminal.cursor_x >= self.client_cols() {
            self.newline();
        }
    }

    /// Feeds one byte through the ANSI/SGR state machine: printable
    /// characters draw and advance the cursor; `\n`, `\r`, backspace, and
    /// ESC/CSI sequences steer it instead.
    fn feed_byte(&mut self, byte: u8) {
        match self.terminal.state {
            ParseState::Normal => match byte {
                0x1B => self.terminal.state = ParseState::SawEsc,
                b'\n' => self.newline(),
                b'\r' => self.terminal.cursor_x = 0,
                0x08 | 0x7F => self.terminal.cursor_x = (self.terminal.cursor_x - 1).max(0),
                0x20..=0x7E => {
                    self.draw_cell();
                    self.advance_cursor();
                }
                _ => {}
            },
            ParseState::SawEsc => {
                if byte == b'[' {
                    self.terminal.state = ParseState::InCsi;
                    self.terminal.params_len = 0;
                } else {
                    self.terminal.state = ParseState::Normal;
                }
            }
            ParseState::InCsi => match byte {
                b'0'..=b'9' | b';' => {
                    if self.terminal.params_len < PARAM_CAPACITY {
                        self.terminal.params[self.terminal.params_len] = byte;
                        self.terminal.params_len += 1;
                    } else {
                        self.terminal.state = ParseState::Normal;
                    }
                }
                0x40..=0x7E => {
                    self.dispatch_csi(byte);
                    self.terminal.params_len = 0;
                    self.terminal.state = ParseState::Normal;
                }
                _ => self.terminal.state = ParseState::Normal,
            },
        }
    }

    fn csi_params(&self) -> impl Iterator<Item = u32> + '_ {
        let text = &self.terminal.params[..self.terminal.params_len];
        text.split(|&b| b == b';').filter(|p| !p.is_empty()).map(|p| {
            p.iter().fold(0_u32, |acc, &b| acc.saturating_mul(10).saturating_add((b - b'0') as u32))
        })
    }

    fn dispatch_csi(&mut self, final_byte: u8) {
        match final_byte {
            b'm' => {
                let params: Vec<u32> = self.csi_params().collect();
                let codes = if params.is_empty() { &[0][..] } else { &params[..] };
                for &code in codes {
                    match code {
                        0 => self.terminal.foreground = WHITE,
                        30..=37 => self.terminal.foreground = PALETTE[(code - 30) as usize],
                        90..=97 => self.terminal.foreground = PALETTE_BRIGHT[(code - 90) as usize],
                        _ => {}
                    }
                }
            }
            b'J' => {
                self.clear();
                self.terminal.cursor_x = 0;
                self.terminal.cursor_y = 0;
            }
            b'H' => {
                self.terminal.cursor_x = 0;
                self.terminal.cursor_y = 0;
            }
            _ => {}
        }
    }

    fn title_bar_rect(&self) -> (i32, i32, i32, i32) {
        (self.x, self.y - config::TITLE_BAR_HEIGHT, self.w as i32, config::TITLE_BAR_HEIGHT)
    }

    fn close_box_rect(&self) -> (i32, i32, i32, i32) {
        let (bar_x, bar_y, bar_w, bar_h) = self.title_bar_rect();
        let size = config::CLOSE_BOX_SIZE;
        let inset = config::CLOSE_BOX_INSET;
        (bar_x + bar_w - size - inset, bar_y + (bar_h - size) / 2, size, size)
    }

    fn contains_with_title_bar(&self, px: i32, py: i32) -> bool {
        let (bx, by, bw, bh) = self.title_bar_rect();
        let in_title_bar = px >= bx && px < bx + bw && py >= by && py < by + bh;
        let in_client = px >= self.x && px < self.x + self.w as i32 && py >= self.y && py < self.y + self.h as i32;
        in_title_bar || in_client
    }
}

struct DragState {
    window_id: u32,
    offset_x: i32,
    offset_y: i32,
}

struct State {
    windows: Vec<Window>,
    next_id: u32,
    mouse_x: i32,
    mouse_y: i32,
    drag: Option<DragState>,
    /// The window currently receiving keyboard input, if any; reads are
    /// gated by focus.
    focused: Option<u32>,
}

static STATE: SpinLock<State> = SpinLock::new(State {
    windows: Vec::new(),
    next_id: 1,
    mouse_x: 0,
    mouse_y: 0,
    drag: None,
    focused: None,
});

static GPU: OnceLock<GpuDevice> = OnceLock::new();

/// Installs the GPU device this compositor flushes through. Must run once
/// during bring-up before the first [`render`].
pub fn init(gpu: GpuDevice) {
    GPU.set(gpu);
}

/// Creates a window, under an IRQ-masked critical section. The window is
/// born focused and on top.
pub fn create(x: i32, y: i32, w: u32, h: u32, title: &str, owner_pid: u32) -> Result<u32, NoSuchWindow> {
    let mut state = STATE.lock();
    let id = state.next_id;
    state.next_id += 1;

    let background = 0xFF20_2020;
    let mut window = Window {
        id,
        x,
        y,
        w,
        h,
        z: state.windows.iter().map(|win| win.z).max().unwrap_or(0) + 1,
        visible: true,
        owner: owner_pid,
        protected: owner_pid == config::SHELL_PID,
        pixels: alloc::vec![0; (w as usize) * (h as usize)],
        background,
        title: String::from(title),
        terminal: Terminal::new(),
    };
    window.clear();
    state.windows.push(window);
    state.focused = Some(id);
    Ok(id)
}

/// Frees a window's backing buffer and removes its record.
pub fn destroy(id: u32) {
    let mut state = STATE.lock();
    state.windows.retain(|w| w.id != id);
    if state.focused == Some(id) {
        state.focused = state.windows.last().map(|w| w.id);
    }
    if let Some(drag) = &state.drag {
        if drag.window_id == id {
            state.drag = None;
        }
    }
}

/// Feeds `bytes` through window `id`'s terminal emulator.
pub fn write(id: u32, bytes: &[u8]) {
    let mut state = STATE.lock();
    if let Some(window) = state.windows.iter_mut().find(|w| w.id == id) {
        for &byte in bytes {
            window.feed_byte(byte);
        }
    }
}

fn check_ownership(owner: u32, caller_pid: u32) -> Result<(), PermissionDenied> {
    if caller_pid == owner || caller_pid == config::INIT_PID {
        Ok(())
    } else {
        Err(PermissionDenied)
    }
}

/// Fills a rectangle inside window `id`'s buffer after checking that
/// `caller_pid` owns it, or is the init process. A permission failure is
/// silent to the caller: logged here and completed without effect.
pub fn draw_rect(id: u32, x: i32, y: i32, w: u32, h: u32, color: u32, caller_pid: u32) -> Result<(), PermissionDenied> {
    let mut state = STATE.lock();
    let window = state.windows.iter_mut().find(|win| win.id == id).ok_or(PermissionDenied)?;
    if let Err(err) = check_ownership(window.owner, caller_pid) {
        crate::log!("pid {caller_pid} denied draw on window {id} (owned by {})", window.owner);
        return Err(err);
    }
    fill_rect(window, x, y, w, h, color);
    Ok(())
}

fn fill_rect(window: &mut Window, x: i32, y: i32, w: u32, h: u32, color: u32) {
    for dy in 0..h as i32 {
        for dx in 0..w as i32 {
            window.put_pixel(x + dx, y + dy, color);
        }
    }
}

/// Fills a rectangle directly in the shared framebuffer, for callers with
/// no window of their own (the init splash case).
pub fn draw_framebuffer_rect(x: i32, y: i32, w: u32, h: u32, color: u32) {
    let Some(gpu) = GPU.get() else { return };
    let fb = gpu.framebuffer_mut();
    let width = gpu.width() as i32;
    let height = gpu.height() as i32;
    for dy in 0..h as i32 {
        let py = y + dy;
        if py < 0 || py >= height {
            continue;
        }
        for dx in 0..w as i32 {
            let px = x + dx;
            if px < 0 || px >= width {
                continue;
            }
            // SAFETY: `fb` spans `width * height` u32 pixels for the life
            // of the GPU device, and `px`/`py` are bounds-checked above.
            unsafe { fb.add((py as usize) * (width as usize) + px as usize).write(color) };
        }
    }
    let _ = gpu.flush(0, 0, width as u32, height as u32);
}

/// Moves window `id` to a new origin.
pub fn move_window(id: u32, x: i32, y: i32) {
    let mut state = STATE.lock();
    if let Some(window) = state.windows.iter_mut().find(|w| w.id == id) {
        window.x = x;
        window.y = y;
    }
}

/// Advances the drag target (if any) by the mouse delta, and clamps the
/// global cursor to the framebuffer.
pub fn update_mouse(dx: i32, dy: i32, absolute: Option<(i32, i32)>) {
    let mut state = STATE.lock();
    let (fb_w, fb_h) = GPU.get().map_or((config::FRAMEBUFFER_WIDTH as i32, config::FRAMEBUFFER_HEIGHT as i32), |g| {
        (g.width() as i32, g.height() as i32)
    });

    if let Some((abs_x, abs_y)) = absolute {
        state.mouse_x = abs_x;
        state.mouse_y = abs_y;
    } else {
        state.mouse_x += dx;
        state.mouse_y += dy;
    }
    state.mouse_x = state.mouse_x.clamp(0, fb_w - 1);
    state.mouse_y = state.mouse_y.clamp(0, fb_h - 1);

    if let Some(drag) = &state.drag {
        let window_id = drag.window_id;
        let offset_x = drag.offset_x;
        let offset_y = drag.offset_y;
        let new_x = state.mouse_x - offset_x;
        let new_y = (state.mouse_y - offset_y).max(config::TITLE_BAR_HEIGHT);
        if let Some(window) = state.windows.iter_mut().find(|w| w.id == window_id) {
            window.x = new_x;
            window.y = new_y;
        }
    }
}

/// Routes a button press/release: on press, raises and optionally starts
/// a drag or closes the topmost window under the cursor; on release, ends
/// any drag.
pub fn handle_click(pressed: bool) {
    let mut state = STATE.lock();
    if !pressed {
        state.drag = None;
        return;
    }

    let mouse_x = state.mouse_x;
    let mouse_y = state.mouse_y;
    let top = state
        .windows
        .iter()
        .filter(|w| w.visible && w.contains_with_title_bar(mouse_x, mouse_y))
        .max_by_key(|w| w.z)
        .map(|w| w.id);

    let Some(id) = top else { return };
    let max_z = state.windows.iter().map(|w| w.z).max().unwrap_or(0);
    let mut should_destroy = false;
    if let Some(window) = state.windows.iter_mut().find(|w| w.id == id) {
        window.z = max_z + 1;
        state.focused = Some(id);

        let (cx, cy, cw, ch) = window.close_box_rect();
        let in_close_box = mouse_x >= cx && mouse_x < cx + cw && mouse_y >= cy && mouse_y < cy + ch;
        if in_close_box && !window.protected {
            should_destroy = true;
        } else {
            let (bx, by, bw, bh) = window.title_bar_rect();
            if mouse_x >= bx && mouse_x < bx + bw && mouse_y >= by && mouse_y < by + bh {
                state.drag = Some(DragState {
                    window_id: id,
                    offset_x: mouse_x - window.x,
                    offset_y: mouse_y - window.y,
                });
            }
        }
    }
    drop(state);
    if should_destroy {
        destroy(id);
    }
    render();
}

/// The pid of the window currently holding input focus, if any; gates
/// the `read` syscall to that window's owner.
pub fn focused_pid() -> Option<u32> {
    let state = STATE.lock();
    let id = state.focused?;
    state.windows.iter().find(|w| w.id == id).map(|w| w.owner)
}

fn blend(dst: u32, src: u32) -> u32 {
    let src_a = (src >> 24) & 0xFF;
    if src_a == 0xFF {
        return src;
    }
    if src_a == 0 {
        return dst;
    }
    let blend_channel = |shift: u32| -> u32 {
        let s = (src >> shift) & 0xFF;
        let d = (dst >> shift) & 0xFF;
        (s * src_a + d * (0xFF - src_a)) / 0xFF
    };
    (0xFF << 24) | (blend_channel(16) << 16) | (blend_channel(8) << 8) | blend_channel(0)
}

fn draw_decorations(fb: *mut u32, fb_w: i32, fb_h: i32, window: &Window) {
    let border_color: u32 = 0xFF60_6060;
    let title_color: u32 = if window.protected { 0xFF40_4080 } else { 0xFF40_4040 };
    let (bx, by, bw, bh) = window.title_bar_rect();

    let put = |fb: *mut u32, x: i32, y: i32, color: u32| {
        if x < 0 || y < 0 || x >= fb_w || y >= fb_h {
            return;
        }
        // SAFETY: `x`/`y` are bounds-checked above against the framebuffer
        // extent this pointer spans.
        unsafe { fb.add((y as usize) * (fb_w as usize) + x as usize).write(color) };
    };

    for dy in 0..bh {
        for dx in 0..bw {
            put(fb, bx + dx, by + dy, title_color);
        }
    }

    for dx in -1..(window.w as i32 + 1) {
        put(fb, window.x + dx, by - 1, border_color);
        put(fb, window.x + dx, window.y + window.h as i32, border_color);
    }
    for dy in -1..(window.h as i32 + bh + 1) {
        put(fb, window.x - 1, by + dy, border_color);
        put(fb, window.x + window.w as i32, by + dy, border_color);
    }

    if !window.protected {
        let (cx, cy, cw, ch) = window.close_box_rect();
        let close_color: u32 = 0xFFAA_2020;
        for dy in 0..ch {
            for dx in 0..cw {
                put(fb, cx + dx, cy + dy, close_color);
            }
        }
    }
}

/// Re-renders the whole scene: gradient background, z-sorted window
/// compositing with decorations, the mouse cursor, then a GPU flush of
/// the full extent.
pub fn render() {
    let Some(gpu) = GPU.get() else { return };
    let fb = gpu.framebuffer_mut();
    let fb_w = gpu.width() as i32;
    let fb_h = gpu.height() as i32;

    for y in 0..fb_h {
        let top = 0x10_2030_u32;
        let bottom = 0x30_5070_u32;
        let t = y as u32 * 255 / (fb_h.max(1) as u32);
        let channel = |shift: u32| -> u32 {
            let a = (top >> shift) & 0xFF;
            let b = (bottom >> shift) & 0xFF;
            (a * (255 - t) + b * t) / 255
        };
        let color = 0xFF00_0000 | (channel(16) << 16) | (channel(8) << 8) | channel(0);
        for x in 0..fb_w {
            // SAFETY: `x`/`y` range over exactly the framebuffer extent.
            unsafe { fb.add((y as usize) * (fb_w as usize) + x as usize).write(color) };
        }
    }

    let state = STATE.lock();
    let mut visible: Vec<&Window> = state.windows.iter().filter(|w| w.visible).collect();
    visible.sort_by_key(|w| w.z);

    for window in &visible {
        draw_decorations(fb, fb_w, fb_h, window);
        for y in 0..window.h as i32 {
            for x in 0..window.w as i32 {
                let src = window.pixels[y as usize * window.w as usize + x as usize];
                let fx = window.x + x;
                let fy = window.y + y;
                if fx < 0 || fy < 0 || fx >= fb_w || fy >= fb_h {
                    continue;
                }
                // SAFETY: `fx`/`fy` are bounds-checked above.
                let offset = (fy as usize) * (fb_w as usize) + fx as usize;
                unsafe {
                    let dst = fb.add(offset).read();
                    fb.add(offset).write(blend(dst, src));
                }
            }
        }
    }

    let cursor_color: u32 = 0xFFFF_FFFF;
    for dy in 0..6 {
        for dx in 0..6 {
            let x = state.mouse_x + dx;
            let y = state.mouse_y + dy;
            if x < 0 || y < 0 || x >= fb_w || y >= fb_h {
                continue;
            }
            // SAFETY: bounds-checked above.
            unsafe { fb.add((y as usize) * (fb_w as usize) + x as usize).write(cursor_color) };
        }
    }
    drop(state);

    let _ = gpu.flush(0, 0, fb_w as u32, fb_h as u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::add_test!(terminal_newline_resets_cursor_x, {
        let mut window = Window {
            id: 1,
            x: 0,
            y: 0,
            w: 64,
            h: 64,
            z: 0,
            visible: true,
            owner: 1,
            protected: false,
            pixels: alloc::vec![0; 64 * 64],
            background: 0,
            title: String::new(),
            terminal: Terminal::new(),
        };
        window.feed_byte(b'a');
        window.feed_byte(b'\n');
        assert_eq!(window.terminal.cursor_x, 0);
        assert_eq!(window.terminal.cursor_y, 1);
    });

    crate::add_test!(sgr_reset_restores_white_foreground, {
        let mut window = Window {
            id: 1,
            x: 0,
            y: 0,
            w: 64,
            h: 64,
            z: 0,
            visible: true,
            owner: 1,
            protected: false,
            pixels: alloc::vec![0; 64 * 64],
            background: 0,
            title: String::new(),
            terminal: Terminal::new(),
        };
        for &byte in b"\x1b[31m" {
            window.feed_byte(byte);
        }
        assert_eq!(window.terminal.foreground, PALETTE[1]);
        for &byte in b"\x1b[0m" {
            window.feed_byte(byte);
        }
        assert_eq!(window.terminal.foreground, WHITE);
    });

    crate::add_test!(csi_overflow_returns_to_normal_without_dispatch, {
        let mut window = Window {
            id: 1,
            x: 0,
            y: 0,
            w: 64,
            h: 64,
            z: 0,
            visible: true,
            owner: 1,
            protected: false,
            pixels: alloc::vec![0; 64 * 64],
            background: 0,
            title: String::new(),
            terminal: Terminal::new(),
        };
        window.feed_byte(0x1B);
        window.feed_byte(b'[');
        for _ in 0..(PARAM_CAPACITY + 1) {
            window.feed_byte(b'9');
        }
        assert_eq!(window.terminal.state, ParseState::Normal);
    });

    crate::add_test!(ownership_check_allows_owner_and_init, {
        assert!(check_ownership(5, 5).is_ok());
        assert!(check_ownership(5, config::INIT_PID).is_ok());
        assert!(check_ownership(5, 6).is_err());
    });

    crate::add_test!(blend_opaque_source_wins, {
        assert_eq!(blend(0xFF00_0000, 0xFFFF_FFFF), 0xFFFF_FFFF);
    });
}
