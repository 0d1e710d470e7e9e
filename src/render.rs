//! Terminal presentation: help screens, the side-by-side game boards,
//! the player list, and the ANSI color table.

use std::fmt;

use crate::board::{Board, Cell, GRID_COLS, MIN_COL_NUMBER, MIN_ROW_LETTER};
use crate::proto::{MAX_USERNAME_LENGTH, PlayerStatus, WhoPlayer};

pub const COLOR_RESET: &str = "\x1b[0m";
pub const COLOR_RED: &str = "\x1b[31m";
pub const COLOR_BOLD_RED: &str = "\x1b[1;31m";
pub const COLOR_GREEN: &str = "\x1b[32m";
pub const COLOR_BOLD_GREEN: &str = "\x1b[1;32m";
pub const COLOR_BLUE: &str = "\x1b[34m";

/// Prefix color for error reports.
pub const COLOR_ERROR: &str = COLOR_BOLD_RED;

const COLOR_PLAYER_IDLE: &str = COLOR_GREEN;
const COLOR_PLAYER_IN_GAME: &str = COLOR_RED;
const COLOR_PLAYER_AWAITING: &str = COLOR_BLUE;

const WHO_STATUS_WIDTH: usize = 37;

/// Input and command errors never terminate the client; they are
/// reported on stderr with a colored prefix and the prompt returns.
pub fn print_error(msg: impl fmt::Display) {
    eprintln!("{COLOR_ERROR}{msg}{COLOR_RESET}");
}

pub fn help_idle() {
    println!(
        "\nAvailable commands:\n\
         !help --> shows the list of available commands\n\
         !who --> shows the list of connected players\n\
         !connect username --> starts a game with the specified player\n\
         !quit --> disconnects and exits"
    );
}

pub fn help_in_game() {
    println!(
        "\nAvailable commands:\n\
         !help --> shows the list of available commands\n\
         !disconnect --> disconnects from the game\n\
         !shot square --> shots the specified square\n\
         !show --> shows the current game table"
    );
}

fn symbol(cell: Cell) -> String {
    match cell {
        Cell::Water => format!("{COLOR_BLUE}#{COLOR_RESET}"),
        Cell::Ship => format!("{COLOR_BOLD_GREEN}@{COLOR_RESET}"),
        Cell::Miss => "-".to_string(),
        Cell::Sunk => format!("{COLOR_BOLD_RED}X{COLOR_RESET}"),
    }
}

/// Print the own board and the opponent shadow board side by side.
pub fn show_boards(my_name: &str, my: &Board, opponent_name: &str, opponent: &Board) {
    let pane = GRID_COLS as usize * 3 + 4;
    println!("\n{my_name:<pane$}\t\t{opponent_name}");

    let mut header = String::from(" X |");
    for col in 0..GRID_COLS {
        header.push_str(&format!("  {}", col + MIN_COL_NUMBER));
    }
    println!("{header}\t\t{header}");

    let rule = format!("---|{}", "-".repeat(GRID_COLS as usize * 3));
    println!("{rule}\t\t{rule}");

    for (i, (my_row, opp_row)) in my.rows().iter().zip(opponent.rows()).enumerate() {
        let letter = (MIN_ROW_LETTER as u8 + i as u8) as char;
        let mut line = format!(" {letter} |");
        for cell in my_row {
            line.push_str(&format!("  {}", symbol(*cell)));
        }
        line.push_str(&format!("\t\t {letter} |"));
        for cell in opp_row {
            line.push_str(&format!("  {}", symbol(*cell)));
        }
        println!("{line}");
    }

    println!(
        "\n\n{} = FREE (WATER) / UNKNOWN\n{} = SHIP\n{} = MISS\n{} = SUNK SHIP (HIT)",
        symbol(Cell::Water),
        symbol(Cell::Ship),
        symbol(Cell::Miss),
        symbol(Cell::Sunk),
    );
}

/// Print the `!who` answer as a colored two-column table.
pub fn print_player_list(players: &[WhoPlayer]) {
    if players.is_empty() {
        println!("There are no connected players.");
        return;
    }

    println!("\n{:<MAX_USERNAME_LENGTH$}\t{:>WHO_STATUS_WIDTH$}\n", "USERNAME", "STATUS");
    for p in players {
        let (color, status) = match p.status {
            PlayerStatus::Idle => (COLOR_PLAYER_IDLE, "IDLE".to_string()),
            PlayerStatus::AwaitingReply => {
                (COLOR_PLAYER_AWAITING, format!("AWAITING REPLY ({})", p.opponent))
            }
            PlayerStatus::InGame => {
                (COLOR_PLAYER_IN_GAME, format!("IN GAME ({})", p.opponent))
            }
        };
        println!(
            "{color}{:<MAX_USERNAME_LENGTH$}\t{status:>WHO_STATUS_WIDTH$}{COLOR_RESET}",
            p.username
        );
    }
}
