/*
 * This file is part of fpinstall.
 *
 * Copyright (C) 2025 fpinstall contributors
 *
 * fpinstall is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * fpinstall is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with fpinstall. If not, see <https://www.gnu.org/licenses/>.
 */

//! fpinstall command line front end: argument parsing, logging setup,
//! report rendering and the fallback monitor. Everything that touches the
//! machine lives in `fp_core`.

pub mod cli;
pub mod commands;
pub mod logging;
pub mod monitor;
pub mod render;
