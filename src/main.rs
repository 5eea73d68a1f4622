use std::time::{Duration, Instant};

use clap::Parser;
use log::info;
use pixels::{Pixels, SurfaceTexture};
use winit::{
    dpi::LogicalSize,
    event::{ElementState, Event, VirtualKeyCode, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    window::WindowBuilder,
};

use monoboy::cartridge::Cartridge;
use monoboy::gameboy::GameBoy;
use monoboy::input::Button;
use monoboy::ppu::{SCREEN_HEIGHT, SCREEN_WIDTH};

const SCALE: u32 = 3;
const FRAME_TIME: Duration = Duration::from_millis(1000 / 60);

#[derive(Parser)]
struct Args {
    /// Path to ROM file
    rom: std::path::PathBuf,

    /// Print CPU state once per 60 frames
    #[arg(long)]
    debug: bool,

    /// Run without opening a window
    #[arg(long)]
    headless: bool,

    /// Number of frames to run in headless mode
    #[arg(long)]
    frames: Option<u64>,

    /// Number of CPU cycles to run in headless mode
    #[arg(long)]
    cycles: Option<u64>,

    /// Number of seconds to run in headless mode
    #[arg(long)]
    seconds: Option<u64>,
}

fn key_button(key: VirtualKeyCode) -> Option<Button> {
    match key {
        VirtualKeyCode::A => Some(Button::A),
        VirtualKeyCode::S => Some(Button::B),
        VirtualKeyCode::Return => Some(Button::Select),
        VirtualKeyCode::Space => Some(Button::Start),
        VirtualKeyCode::Up => Some(Button::Up),
        VirtualKeyCode::Down => Some(Button::Down),
        VirtualKeyCode::Left => Some(Button::Left),
        VirtualKeyCode::Right => Some(Button::Right),
        _ => None,
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let cart = match Cartridge::from_file(&args.rom) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load ROM: {e}");
            std::process::exit(1);
        }
    };

    let mut gb = GameBoy::with_cart(cart);
    info!("emulator initialized");

    if args.headless {
        run_headless(&mut gb, &args);
        return;
    }

    let event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title("monoboy")
        .with_inner_size(LogicalSize::new(
            (SCREEN_WIDTH as u32 * SCALE) as f64,
            (SCREEN_HEIGHT as u32 * SCALE) as f64,
        ))
        .build(&event_loop)
        .expect("Failed to create window");

    let size = window.inner_size();
    let surface = SurfaceTexture::new(size.width, size.height, &window);
    let mut pixels = Pixels::new(SCREEN_WIDTH as u32, SCREEN_HEIGHT as u32, surface)
        .expect("Pixels error");

    let mut frame = vec![0u32; SCREEN_WIDTH * SCREEN_HEIGHT];
    let mut frame_count = 0u64;
    let mut next_frame = Instant::now();

    event_loop.run(move |event, _, control_flow| {
        *control_flow = ControlFlow::Poll;
        match event {
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => *control_flow = ControlFlow::Exit,
                WindowEvent::Resized(size) => {
                    let _ = pixels.resize_surface(size.width, size.height);
                }
                WindowEvent::KeyboardInput { input, .. } => {
                    if let Some(key) = input.virtual_keycode {
                        let pressed = input.state == ElementState::Pressed;
                        if key == VirtualKeyCode::Escape {
                            if pressed {
                                *control_flow = ControlFlow::Exit;
                            }
                        } else if let Some(button) = key_button(key) {
                            if pressed {
                                gb.mmu.input.press(button, &mut gb.mmu.if_reg);
                            } else {
                                gb.mmu.input.release(button, &mut gb.mmu.if_reg);
                            }
                        }
                    }
                }
                _ => {}
            },
            Event::MainEventsCleared => {
                gb.run_frame();
                frame.copy_from_slice(gb.mmu.ppu.framebuffer());
                window.request_redraw();

                if args.debug && frame_count % 60 == 0 {
                    println!("{}", gb.cpu.debug_state());
                }
                frame_count += 1;

                // Pace to ~60 frames per second.
                next_frame += FRAME_TIME;
                let now = Instant::now();
                if next_frame > now {
                    std::thread::sleep(next_frame - now);
                } else {
                    next_frame = now;
                }
            }
            Event::RedrawRequested(_) => {
                pixels.frame_mut().copy_from_slice(bytemuck::cast_slice(&frame));
                if pixels.render().is_err() {
                    *control_flow = ControlFlow::Exit;
                }
            }
            _ => {}
        }
    });
}

fn run_headless(gb: &mut GameBoy, args: &Args) {
    let start = Instant::now();
    let second_limit = args.seconds.map(Duration::from_secs);
    let mut frame_count = 0u64;

    loop {
        gb.run_frame();
        frame_count += 1;

        if args.debug && frame_count % 60 == 0 {
            println!("{}", gb.cpu.debug_state());
        }
        if args.frames.is_some_and(|max| frame_count >= max) {
            break;
        }
        if args.cycles.is_some_and(|max| gb.cpu.cycles >= max) {
            break;
        }
        if second_limit.is_some_and(|limit| start.elapsed() >= limit) {
            break;
        }
    }
}
